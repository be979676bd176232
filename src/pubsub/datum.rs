use std::time::{SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};

/// One named, timestamped unit of published data. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct Datum {
    name: String,
    data: Vec<u8>,
    time: u64,
}

impl Datum {
    /// `time` is in microseconds since the UNIX epoch.
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>, time: u64) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            time,
        }
    }

    /// Stamps the datum with the current time.
    pub fn now(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::new(name, data, timestamp())
    }

    /// Topic of the datum.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn time(&self) -> u64 {
        self.time
    }
}

/// Microseconds since the UNIX epoch; `0` if the clock is set before it.
pub fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}
