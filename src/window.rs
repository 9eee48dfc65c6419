use std::time::Duration;

/// Length of one admission window
pub const WINDOW: Duration = Duration::from_secs(1);

/// Admission budget of a single one-second window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    open: bool,
    admitted: u32,
    capacity: u32,
}

impl Window {
    pub fn new(capacity: u32) -> Self {
        Self {
            open: false,
            admitted: 0,
            capacity,
        }
    }

    /// Start a fresh window. The caller is responsible for arming its timer.
    pub fn open(&mut self) {
        self.open = true;
        self.admitted = 0;
    }

    /// Consume one slot if the window is open and has budget left
    pub fn try_admit(&mut self) -> bool {
        if self.open && self.admitted < self.capacity {
            self.admitted += 1;
            true
        } else {
            false
        }
    }

    pub fn close(&mut self) {
        self.open = false;
        self.admitted = 0;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn admitted(&self) -> u32 {
        self.admitted
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn remaining(&self) -> u32 {
        if self.open {
            self.capacity - self.admitted
        } else {
            self.capacity
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_creation() {
        let window = Window::new(3);
        assert!(!window.is_open());
        assert_eq!(window.admitted(), 0);
        assert_eq!(window.capacity(), 3);
        assert_eq!(window.remaining(), 3);
    }

    #[test]
    fn test_closed_window_admits_nothing() {
        let mut window = Window::new(3);
        assert!(!window.try_admit());
        assert_eq!(window.admitted(), 0);
    }

    #[test]
    fn test_admission_stops_at_capacity() {
        let mut window = Window::new(2);
        window.open();
        assert!(window.try_admit());
        assert!(window.try_admit());
        assert!(!window.try_admit());
        assert_eq!(window.admitted(), 2);
        assert_eq!(window.remaining(), 0);
    }

    #[test]
    fn test_close_resets_budget() {
        let mut window = Window::new(1);
        window.open();
        assert!(window.try_admit());

        window.close();
        assert!(!window.is_open());
        assert_eq!(window.admitted(), 0);

        window.open();
        assert!(window.try_admit());
    }
}
