use std::fmt;
use std::str::FromStr;

use crate::error::DskError;

/// Where a tensor's buffer lives. Operators only accept tensors on the
/// accelerator their context drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Cpu,
    /// Emulated accelerator by ordinal.
    Xpu(usize),
}

impl Device {
    pub fn is_accelerator(self) -> bool {
        matches!(self, Device::Xpu(_))
    }

    pub fn ordinal(self) -> Option<usize> {
        if let Device::Xpu(n) = self {
            Some(n)
        } else {
            None
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Device::Cpu => f.write_str("cpu"),
            Device::Xpu(n) => write!(f, "xpu:{n}"),
        }
    }
}

/// Parses `cpu`, `xpu` (ordinal 0) or `xpu:N`.
impl FromStr for Device {
    type Err = DskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || DskError::Config(format!("unrecognised device {s:?}"));
        match s.trim().split_once(':') {
            None if s.trim() == "cpu" => Ok(Device::Cpu),
            None if s.trim() == "xpu" => Ok(Device::Xpu(0)),
            Some(("xpu", n)) => n.parse().map(Device::Xpu).map_err(|_| bad()),
            _ => Err(bad()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accelerator_ordinal() {
        assert!(Device::Xpu(2).is_accelerator());
        assert_eq!(Device::Xpu(2).ordinal(), Some(2));
        assert!(!Device::default().is_accelerator());
        assert_eq!(Device::Cpu.ordinal(), None);
    }

    #[test]
    fn display_parse_agree() {
        for dev in [Device::Cpu, Device::Xpu(0), Device::Xpu(3)] {
            assert_eq!(dev.to_string().parse::<Device>().ok(), Some(dev));
        }
        assert_eq!("xpu".parse::<Device>().ok(), Some(Device::Xpu(0)));
        assert!("gpu:1".parse::<Device>().is_err());
        assert!("xpu:x".parse::<Device>().is_err());
    }
}
