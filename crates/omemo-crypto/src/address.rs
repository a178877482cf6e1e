use std::fmt;

/// One device of one account: the key for sessions and pinned identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress {
    /// Bare account address, without any resource.
    pub bare: String,
    pub device_id: u32,
}

impl DeviceAddress {
    pub fn new(bare: impl Into<String>, device_id: u32) -> Self {
        Self {
            bare: bare.into(),
            device_id,
        }
    }
}

/// Store key form: `"<bare>.<device id>"`.
impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.bare, self.device_id)
    }
}
