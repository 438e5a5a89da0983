use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::limits::MAX_WAL_FRAME_LEN;
use crate::model::Event;

const FRAME_OVERHEAD: u64 = 8;

/// Serialize one event as a complete `[len][bincode][crc32]` frame.
/// Nothing touches the log if this fails.
pub fn encode_frame(event: &Event) -> io::Result<Vec<u8>> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_WAL_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "event too large"));
    }
    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD as usize);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(frame)
}

/// Read one frame and its size on disk. `Ok(None)` on clean EOF or a torn/corrupt tail.
fn decode_event(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_WAL_FRAME_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Event>(&payload)
        .ok()
        .map(|event| (event, len as u64 + FRAME_OVERHEAD)))
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Valid events and the byte length of the prefix holding them.
fn read_log(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut valid_len = 0;
    while let Some((event, size)) = decode_event(&mut reader)? {
        events.push(event);
        valid_len += size;
    }
    Ok((events, valid_len))
}

/// Append-only write-ahead log of reservation events.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`, little endian.
/// A truncated or corrupt trailing entry (crash mid-write) ends replay.
/// The file never grows past `durable_len` except inside [`Wal::write_batch`].
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// Length of the acknowledged prefix of the file.
    durable_len: u64,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            durable_len,
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.write_batch(&[encode_frame(event)?])
    }

    /// Write and fsync pre-encoded frames as one unit. On failure the file is
    /// cut back to its last acknowledged length, so none of the batch survives.
    pub fn write_batch(&mut self, frames: &[Vec<u8>]) -> io::Result<()> {
        let written: u64 = frames.iter().map(|f| f.len() as u64).sum();
        let result = frames
            .iter()
            .try_for_each(|frame| self.writer.write_all(frame))
            .and_then(|()| self.flush_sync());
        match result {
            Ok(()) => {
                self.durable_len += written;
                self.appends_since_compact += frames.len() as u64;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback() {
                    tracing::error!("WAL rollback failed: {rollback_err}");
                }
                Err(e)
            }
        }
    }

    fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Drop buffered bytes and truncate anything past `durable_len`.
    fn rollback(&mut self) -> io::Result<()> {
        let file = self.writer.get_ref().try_clone()?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the buffer without flushing it.
        drop(stale.into_parts());
        self.writer.get_ref().set_len(self.durable_len)?;
        self.writer.get_ref().sync_all()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write `events` to `<wal>.tmp`, fsync, then rename over the live log and reopen.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        let mut compacted_len = 0;
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                let frame = encode_frame(event)?;
                writer.write_all(&frame)?;
                compacted_len += frame.len() as u64;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.durable_len = compacted_len;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Replay every valid event from disk. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        read_log(path).map(|(events, _)| events)
    }

    /// Replay, then cut off any torn or corrupt tail so later appends land
    /// directly after the last valid frame.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let (events, valid_len) = read_log(path)?;
        if let Ok(meta) = fs::metadata(path)
            && meta.len() > valid_len
        {
            tracing::warn!(
                "WAL {}: discarding {} bytes of torn tail after {} events",
                path.display(),
                meta.len() - valid_len,
                events.len()
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Reservation, Span};
    use chrono::{TimeZone, Utc};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roombook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn created(h: u32) -> Event {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap();
        Event::ReservationCreated {
            reservation: Reservation {
                id: Ulid::new(),
                resource_id: "room-a".into(),
                owner_id: "alice".into(),
                title: "sync".into(),
                description: Some("weekly".into()),
                span: Span::new(start, start + chrono::TimeDelta::hours(1)),
                created_at: start,
                updated_at: start,
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            created(9),
            Event::ReservationDeleted {
                id: Ulid::new(),
                resource_id: "room-a".into(),
            },
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 2);
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("does_not_exist.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn truncated_tail_is_discarded() {
        let path = tmp_path("truncated.wal");
        let first = created(9);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            wal.append(&created(10)).unwrap();
        }
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
    }

    #[test]
    fn corrupt_crc_stops_replay() {
        let path = tmp_path("corrupt.wal");
        let first = created(9);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            wal.append(&created(10)).unwrap();
        }
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
    }

    #[test]
    fn compact_replaces_log_and_resets_counter() {
        let path = tmp_path("compact.wal");
        let keep = created(11);
        let mut wal = Wal::open(&path).unwrap();
        for h in 8..11 {
            wal.append(&created(h)).unwrap();
        }
        wal.compact(std::slice::from_ref(&keep)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);

        let after = created(12);
        wal.append(&after).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![keep, after]);
    }

    #[test]
    fn recover_truncates_torn_tail_so_appends_survive() {
        let path = tmp_path("recover_torn.wal");
        let first = created(9);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xde, 0xad, 0xbe, 0xef, 0x01, 0x02]).unwrap();
        drop(file);

        assert_eq!(Wal::recover(&path).unwrap(), vec![first.clone()]);
        let second = created(10);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&second).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn oversized_length_header_is_a_torn_tail() {
        let path = tmp_path("oversized_header.wal");
        let first = created(9);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&u32::MAX.to_le_bytes()).unwrap();
        drop(file);

        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
    }

    #[test]
    fn oversized_event_is_refused_before_writing() {
        let Event::ReservationCreated { mut reservation } = created(9) else {
            unreachable!()
        };
        reservation.description = Some("x".repeat(MAX_WAL_FRAME_LEN));
        let err = encode_frame(&Event::ReservationCreated { reservation }).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn failed_flush_leaves_log_untouched() {
        let path = tmp_path("failed_flush.wal");
        let first = created(9);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        // A read-only handle makes every write fail at flush time.
        let read_only = File::open(&path).unwrap();
        let durable_len = read_only.metadata().unwrap().len();
        let mut wal = Wal {
            writer: BufWriter::new(read_only),
            path: path.clone(),
            durable_len,
            appends_since_compact: 0,
        };
        let frames = vec![encode_frame(&created(10)).unwrap(), encode_frame(&created(11)).unwrap()];
        assert!(wal.write_batch(&frames).is_err());
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(wal.writer.buffer().is_empty());
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
    }

    #[test]
    fn rollback_cuts_unacknowledged_bytes() {
        let path = tmp_path("rollback.wal");
        let first = created(9);
        let second = created(10);
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&first).unwrap();

        // Half a frame reaches the file, as if a flush died midway.
        let frame = encode_frame(&created(11)).unwrap();
        wal.writer.write_all(&frame[..frame.len() / 2]).unwrap();
        wal.writer.flush().unwrap();
        wal.rollback().unwrap();

        wal.append(&second).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
    }
}
