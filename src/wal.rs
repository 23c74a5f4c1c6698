use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Larger length prefixes can only come from a corrupt tail.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Encode a single event to `[len][bincode][crc32]`.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Outcome of reading one record during replay.
enum Record {
    Event(Event),
    /// Clean end of file.
    End,
    /// Truncated or corrupt tail; everything from here on is discarded.
    Torn(&'static str),
}

/// Fill `buf`, distinguishing a clean EOF before the first byte from a short read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<Option<usize>> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(Some(filled)),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

fn read_record(reader: &mut impl Read) -> io::Result<Record> {
    let mut len_buf = [0u8; 4];
    match read_full(reader, &mut len_buf)? {
        None => {}
        Some(0) => return Ok(Record::End),
        Some(_) => return Ok(Record::Torn("truncated length prefix")),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(Record::Torn("oversized record"));
    }

    let mut payload = vec![0u8; len];
    if read_full(reader, &mut payload)?.is_some() {
        return Ok(Record::Torn("truncated payload"));
    }
    let mut crc_buf = [0u8; 4];
    if read_full(reader, &mut crc_buf)?.is_some() {
        return Ok(Record::Torn("truncated checksum"));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Record::Torn("checksum mismatch"));
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Record::Event(event)),
        Err(_) => Ok(Record::Torn("undecodable payload")),
    }
}

/// Append-only write-ahead log of scheduling events.
///
/// Format per entry: `[u32 LE: len][bincode: Event][u32 LE: crc32]`.
/// A torn last entry (crash mid-write) is dropped on replay.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync one event. Production code batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event without flushing; commit with `flush_sync()`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write compacted events to a temp file next to the WAL and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let file = File::create(Self::compact_tmp_path(path))?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the WAL and reopen it for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid events. A missing file
    /// replays as empty.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();

        loop {
            match read_record(&mut reader)? {
                Record::Event(event) => events.push(event),
                Record::End => break,
                Record::Torn(why) => {
                    tracing::warn!(
                        "WAL {}: discarding tail after {} events ({why})",
                        path.display(),
                        events.len()
                    );
                    break;
                }
            }
        }

        Ok(events)
    }
}
