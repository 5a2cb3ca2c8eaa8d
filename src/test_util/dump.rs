use std::sync::Mutex;

use anyhow::bail;

use crate::plug::dump::DumpSink;

/// Records every dumped message instead of rendering it
#[derive(Default)]
pub struct RecordingDumpSink {
    records: Mutex<Vec<(String, String, Vec<u8>)>>,
    failing: bool,
}

impl RecordingDumpSink {
    /// a sink that rejects every message, for checking that a broken dump does not break sending
    pub fn failing() -> RecordingDumpSink {
        RecordingDumpSink {
            records: Default::default(),
            failing: true,
        }
    }

    /// `(from, to, data)` for each message in the order it was dumped
    pub fn records(&self) -> Vec<(String, String, Vec<u8>)> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl DumpSink for RecordingDumpSink {
    fn dump(&self, from: &str, to: &str, data: &[u8]) -> anyhow::Result<()> {
        if self.failing {
            bail!("dump sink is configured to fail");
        }
        match self.records.lock() {
            Ok(mut records) => records.push((from.to_string(), to.to_string(), data.to_vec())),
            Err(poisoned) => poisoned.into_inner().push((from.to_string(), to.to_string(), data.to_vec())),
        }
        Ok(())
    }
}
