use std::fmt;

/// An accelerator a tower is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Device {
    ordinal: usize,
}

impl Device {
    /// Creates a new `Device`.
    ///
    /// # Arguments
    /// * `ordinal` - The index of the device in the visible device list.
    pub fn new(ordinal: usize) -> Self {
        Self { ordinal }
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/gpu:{}", self.ordinal)
    }
}
