use std::{collections::HashSet, str::FromStr};

use ml_core::Device;

use crate::{Result, TowerErr};

/// The ordered list of devices a step is spread over. The first one leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSet {
    devices: Vec<Device>,
}

impl DeviceSet {
    /// Creates a new `DeviceSet`.
    ///
    /// # Returns
    /// An `InvalidDevices` error if `devices` is empty or has duplicates.
    pub fn new(devices: Vec<Device>) -> Result<Self> {
        if devices.is_empty() {
            return Err(TowerErr::InvalidDevices("no devices".to_string()));
        }

        let mut seen = HashSet::new();
        if let Some(dup) = devices.iter().find(|d| !seen.insert(**d)) {
            return Err(TowerErr::InvalidDevices(format!("{dup} is listed twice")));
        }

        Ok(Self { devices })
    }

    /// A set of the first `count` devices.
    pub fn first(count: usize) -> Result<Self> {
        Self::new((0..count).map(Device::new).collect())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn lead(&self) -> Device {
        self.devices[0]
    }

    pub fn iter(&self) -> impl Iterator<Item = Device> + '_ {
        self.devices.iter().copied()
    }

    /// Checks that a global batch can be split into one equally sized shard per device.
    pub fn check_divisible(&self, batch: usize) -> Result<()> {
        if batch == 0 || batch % self.len() != 0 {
            return Err(TowerErr::BatchNotDivisible {
                batch,
                devices: self.len(),
            });
        }

        Ok(())
    }
}

impl FromStr for DeviceSet {
    type Err = TowerErr;

    /// Parses a comma separated list of device ordinals such as `"0,1"`.
    fn from_str(s: &str) -> Result<Self> {
        let devices = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse()
                    .map(Device::new)
                    .map_err(|_| TowerErr::InvalidDevices(format!("{part:?} isn't a device ordinal")))
            })
            .collect::<Result<Vec<_>>>()?;

        Self::new(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gpu_lists() {
        let set: DeviceSet = " 0, 1,3 ".parse().unwrap();

        assert_eq!(set.len(), 3);
        assert_eq!(set.lead(), Device::new(0));
        assert_eq!(set.iter().last(), Some(Device::new(3)));
    }

    #[test]
    fn rejects_bad_lists() {
        assert!("".parse::<DeviceSet>().is_err());
        assert!("0,0".parse::<DeviceSet>().is_err());
        assert!("0,gpu1".parse::<DeviceSet>().is_err());
    }

    #[test]
    fn batch_must_divide_evenly() {
        let set = DeviceSet::first(2).unwrap();

        assert!(set.check_divisible(28).is_ok());
        assert!(matches!(
            set.check_divisible(27),
            Err(TowerErr::BatchNotDivisible { batch: 27, devices: 2 })
        ));
        assert!(set.check_divisible(0).is_err());
    }
}
