use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

const HEADER_LEN: u64 = 4 + 8;
const TRAILER_LEN: u64 = 4;
/// Larger length prefixes are treated as corruption.
const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

/// Checksum covers the sequence number and the payload.
fn frame_crc(seq: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&seq.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

fn encode_record(writer: &mut impl Write, seq: u64, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&seq.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&frame_crc(seq, &payload).to_le_bytes())?;
    Ok(())
}

/// Result of reading a journal back.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte length of the valid prefix; anything after it is a torn write.
    pub valid_len: u64,
}

/// Append-only journal of engine events.
///
/// Record layout: `[u32 len][u64 seq][bincode Event][u32 crc32(seq ‖ payload)]`.
/// Sequence numbers start at 0 in every file and must be contiguous; replay
/// stops at the first short, corrupt or out-of-sequence record.
pub struct Journal {
    writer: BufWriter<File>,
    path: PathBuf,
    next_seq: u64,
    appends_since_compact: u64,
}

impl Journal {
    /// Replay `path`, cut off any torn tail, and open it for appending.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let replay = Self::replay(path)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() > replay.valid_len {
            tracing::warn!(
                "journal {}: discarding torn tail after byte {}",
                path.display(),
                replay.valid_len
            );
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }
        drop(file);

        let file = OpenOptions::new().append(true).open(path)?;
        let journal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            next_seq: replay.events.len() as u64,
            appends_since_compact: 0,
        };
        Ok((journal, replay.events))
    }

    /// Buffer one record. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_record(&mut self.writer, self.next_seq, event)?;
        self.next_seq += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the journal with `events`: write a temp file, fsync, rename over.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        self.flush_sync()?;
        let tmp_path = self.path.with_extension("journal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for (seq, event) in events.iter().enumerate() {
                encode_record(&mut writer, seq as u64, event)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.next_seq = events.len() as u64;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Read every valid record. A missing file is an empty journal.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();

        loop {
            let mut header = [0u8; HEADER_LEN as usize];
            if !read_full(&mut reader, &mut header)? {
                break;
            }
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let mut seq_bytes = [0u8; 8];
            seq_bytes.copy_from_slice(&header[4..]);
            let seq = u64::from_le_bytes(seq_bytes);
            if seq != replay.events.len() as u64 || len > MAX_RECORD_LEN {
                break;
            }

            let mut payload = vec![0u8; len as usize];
            if !read_full(&mut reader, &mut payload)? {
                break;
            }
            let mut crc = [0u8; TRAILER_LEN as usize];
            if !read_full(&mut reader, &mut crc)? {
                break;
            }
            if u32::from_le_bytes(crc) != frame_crc(seq, &payload) {
                break;
            }
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => replay.events.push(event),
                Err(_) => break,
            }
            replay.valid_len += HEADER_LEN + u64::from(len) + TRAILER_LEN;
        }

        Ok(replay)
    }
}

/// `read_exact` that reports a clean or torn EOF as `false`.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
