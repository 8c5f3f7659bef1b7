use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// First bytes of every journal file.
const MAGIC: &[u8; 8] = b"RCAPWAL1";

/// Anything larger is treated as a torn length prefix.
const MAX_RECORD_LEN: usize = 1 << 20;

/// One record holds one commit unit: the events that must land together.
fn encode_record(writer: &mut impl Write, events: &[Event]) -> io::Result<()> {
    let payload =
        bincode::serialize(events).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

fn open_for_append(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let fresh = file.metadata()?.len() == 0;
    let mut writer = BufWriter::new(file);
    if fresh {
        writer.write_all(MAGIC)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    Ok(writer)
}

/// What replay recovered from disk.
#[derive(Debug, Default)]
pub struct Replayed {
    pub events: Vec<Event>,
    /// Set when a torn or corrupt tail was dropped.
    pub discarded_tail: bool,
}

/// Append-only journal of ledger events.
///
/// Layout: `MAGIC` then records of `[u32 le: len][bincode: Vec<Event>][u32 le: crc32]`.
/// A record is all-or-nothing on replay; a torn last record (crash mid-write)
/// is dropped whole.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length after the last successful `flush_sync`.
    synced_len: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let writer = open_for_append(path)?;
        let synced_len = writer.get_ref().metadata()?.len();
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            appends_since_compact: 0,
            synced_len,
        })
    }

    /// Append and fsync a single event. Production goes through the group-commit
    /// writer instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(std::slice::from_ref(event))?;
        self.flush_sync()
    }

    /// Buffer one commit unit; durable only after `flush_sync`.
    pub fn append_buffered(&mut self, events: &[Event]) -> io::Result<()> {
        encode_record(&mut self.writer, events)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len = self.writer.get_ref().metadata()?.len();
        Ok(())
    }

    /// Throw away everything written since the last successful `flush_sync`,
    /// buffered or already on disk, so a failed batch leaves no half record
    /// in front of later appends.
    pub fn discard_unsynced(&mut self) -> io::Result<()> {
        let fresh = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        let (file, _unwritten) = std::mem::replace(&mut self.writer, fresh).into_parts();
        file.set_len(self.synced_len)?;
        file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write a replacement journal next to the live one.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        writer.write_all(MAGIC)?;
        for event in events {
            encode_record(&mut writer, std::slice::from_ref(event))?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the replacement over the live journal and reopen it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        self.writer = open_for_append(&self.path)?;
        self.synced_len = self.writer.get_ref().metadata()?.len();
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Read every intact record. A missing or empty file is an empty journal; a
    /// file that does not start with the journal magic is refused.
    pub fn replay(path: &Path) -> io::Result<Replayed> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replayed::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut out = Replayed::default();

        let mut magic = [0u8; 8];
        match read_full(&mut reader, &mut magic)? {
            0 => return Ok(out),
            n if n < magic.len() || &magic != MAGIC => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{} is not a rentcap journal", path.display()),
                ));
            }
            _ => {}
        }

        loop {
            let mut len_buf = [0u8; 4];
            match read_full(&mut reader, &mut len_buf)? {
                0 => break,
                4 => {}
                _ => {
                    out.discarded_tail = true;
                    break;
                }
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_RECORD_LEN {
                out.discarded_tail = true;
                break;
            }

            let mut payload = vec![0u8; len];
            let mut crc_buf = [0u8; 4];
            if read_full(&mut reader, &mut payload)? < len
                || read_full(&mut reader, &mut crc_buf)? < 4
                || u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload)
            {
                out.discarded_tail = true;
                break;
            }

            match bincode::deserialize::<Vec<Event>>(&payload) {
                Ok(unit) => out.events.extend(unit),
                Err(_) => {
                    out.discarded_tail = true;
                    break;
                }
            }
        }

        Ok(out)
    }
}

/// Like `read_exact`, but reports how many bytes were read before EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
