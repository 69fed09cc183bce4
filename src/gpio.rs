//! Bus receive-enable line, exported through sysfs and driven low for the
//! lifetime of the engine.

use std::{fs, path::PathBuf, thread, time::Duration};

use anyhow::{Context, Result};

pub struct ReceiveEnable {
    line: u32,
}

impl ReceiveEnable {
    /// Export the line, configure it as an output and drive it low.
    pub fn acquire(line: u32) -> Result<Self> {
        let base = PathBuf::from(format!("/sys/class/gpio/gpio{line}"));
        if !base.exists() {
            fs::write("/sys/class/gpio/export", line.to_string())
                .with_context(|| format!("Failed to export GPIO {line}"))?;
            // The attribute files appear shortly after the export.
            thread::sleep(Duration::from_millis(50));
        }
        fs::write(base.join("direction"), "out")
            .with_context(|| format!("Failed to configure GPIO {line} as an output"))?;
        fs::write(base.join("value"), "0")
            .with_context(|| format!("Failed to drive GPIO {line} low"))?;
        log::info!("Receive enable on GPIO {line} driven low");
        Ok(ReceiveEnable { line })
    }
}

impl Drop for ReceiveEnable {
    fn drop(&mut self) {
        let _ = fs::write("/sys/class/gpio/unexport", self.line.to_string());
    }
}
