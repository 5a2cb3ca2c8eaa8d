use std::fs::File;
use std::io::Write;
use std::sync::Mutex;

use anyhow::anyhow;

use crate::plug::plug_config::{DumpFormat, LogConfig, OutputTarget};

/// Every message that is relayed or injected passes through a [DumpSink] before it leaves the
///  process.
pub trait DumpSink: Send + Sync + 'static {
    fn dump(&self, from: &str, to: &str, data: &[u8]) -> anyhow::Result<()>;
}

pub struct NoopDumpSink;
impl DumpSink for NoopDumpSink {
    fn dump(&self, _from: &str, _to: &str, _data: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct WriterDumpSink {
    out: Mutex<Box<dyn Write + Send>>,
    format: DumpFormat,
    verbose: bool,
}

impl WriterDumpSink {
    pub fn new(out: Box<dyn Write + Send>, format: DumpFormat, verbose: bool) -> WriterDumpSink {
        WriterDumpSink {
            out: Mutex::new(out),
            format,
            verbose,
        }
    }

    fn render(&self, from: &str, to: &str, data: &[u8], out: &mut dyn Write) -> std::io::Result<()> {
        if self.verbose {
            writeln!(out, "%% {} SAYS TO {} LEN={}", from, to, data.len())?;
        }
        match self.format {
            DumpFormat::Hex => hexdump(data, out)?,
            DumpFormat::Raw => {
                out.write_all(data)?;
                out.write_all(b"\n")?;
            }
        }
        if self.verbose {
            writeln!(out, "%%")?;
        }
        out.flush()
    }
}

impl DumpSink for WriterDumpSink {
    fn dump(&self, from: &str, to: &str, data: &[u8]) -> anyhow::Result<()> {
        let mut out = self.out.lock()
            .map_err(|_| anyhow!("dump output is poisoned"))?;
        self.render(from, to, data, out.as_mut())?;
        Ok(())
    }
}

/// Creates the dump sink described by a [LogConfig]
pub fn dump_sink_for(config: &LogConfig) -> anyhow::Result<Box<dyn DumpSink>> {
    let format = match config.dump_format {
        None => return Ok(Box::new(NoopDumpSink)),
        Some(format) => format,
    };

    let out: Box<dyn Write + Send> = match &config.output {
        OutputTarget::Stderr => Box::new(std::io::stderr()),
        OutputTarget::Stdout => Box::new(std::io::stdout()),
        OutputTarget::File(path) => Box::new(File::options().create(true).append(true).open(path)?),
    };
    Ok(Box::new(WriterDumpSink::new(out, format, config.verbose)))
}

const HEXDUMP_LINE_LEN: usize = 16;

/// Writes data in the style of `hexdump -C`, terminated by a line with the total length.
pub fn hexdump(data: &[u8], out: &mut dyn Write) -> std::io::Result<()> {
    let half = HEXDUMP_LINE_LEN / 2;

    let mut offset = 0usize;
    for line in data.chunks(HEXDUMP_LINE_LEN) {
        write!(out, "{:08x}  ", offset)?;

        for (i, b) in line.iter().enumerate() {
            write!(out, "{:02x} ", b)?;
            if i + 1 == half {
                write!(out, " ")?;
            }
        }
        for _ in line.len()..HEXDUMP_LINE_LEN {
            write!(out, "   ")?;
        }
        if line.len() < half {
            write!(out, " ")?;
        }

        write!(out, " |")?;
        for &b in line {
            let c = if (0x20..0x7f).contains(&b) { b as char } else { '.' };
            write!(out, "{}", c)?;
        }
        writeln!(out, "|")?;

        offset += line.len();
    }
    writeln!(out, "{:08x}", offset)
}
