use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
pub struct Resources {
    pub cpu: u32, // in millicores
    pub ram: u64, // in bytes
}

impl Default for Resources {
    fn default() -> Self {
        Self { cpu: 0, ram: 0 }
    }
}

impl Resources {
    pub fn new(cpu: u32, ram: u64) -> Self {
        Self { cpu, ram }
    }

    pub fn fits_into(&self, other: &Resources) -> bool {
        self.cpu <= other.cpu && self.ram <= other.ram
    }
}
