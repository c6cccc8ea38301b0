//! The write-ahead log.
//!
//! Every protocol message that can change externally visible state
//! is appended and fsynced before the transition is acknowledged.
//! Segments live in one directory, named
//! `log_<created_ms>_<min_seq>_<max_seq>_<stable_ckpt>.log`; the
//! currently open segment carries `min_seq == -1` and is atomically
//! renamed to its final range-bearing name when the stable
//! checkpoint advances. On startup the directory is scanned, the
//! newest open segment resumed, and records above the stable
//! checkpoint replayed.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bft::communication::message::{Request, SignatureInfo, SystemInfoData};
use crate::bft::communication::serialize;
use crate::bft::error::*;
use crate::bft::ordering::{Orderable, SeqNo};

const LEN_PREFIX: usize = 8;

/// Knobs controlling the write-ahead log.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Master switch; when off, every operation is a no-op.
    pub enabled: bool,
    /// Base path of the log, e.g. `./wal_log/log`; segments land in
    /// its parent directory.
    pub path: PathBuf,
    /// Size after which the in-memory buffer must be flushed even
    /// without a durability boundary.
    pub buffer_size: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("./wal_log/log"),
            buffer_size: 1024,
        }
    }
}

/// One replayed log record.
#[derive(Debug, Clone)]
pub struct WalRecord {
    pub request: Request,
    pub signature: Option<SignatureInfo>,
    pub last_executed_seq: u64,
}

struct WalState {
    file: Option<File>,
    path: PathBuf,
    buffer: Vec<u8>,
    min_seq: i64,
    max_seq: i64,
    last_ckpt: i64,
}

/// The append-only write-ahead log of one replica.
pub struct Wal {
    enabled: bool,
    base: PathBuf,
    state: Mutex<WalState>,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// Parsed `log_<created>_<min>_<max>_<ckpt>.log` file name.
#[derive(Debug, Copy, Clone)]
struct SegmentName {
    created_ms: i64,
    min_seq: i64,
    max_seq: i64,
    ckpt: i64,
}

fn parse_segment_name(path: &Path) -> Option<SegmentName> {
    if path.extension()?.to_str()? != "log" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let mut fields = stem.rsplitn(5, '_');
    let ckpt = fields.next()?.parse().ok()?;
    let max_seq = fields.next()?.parse().ok()?;
    let min_seq = fields.next()?.parse().ok()?;
    let created_ms = fields.next()?.parse().ok()?;
    fields.next()?;
    Some(SegmentName {
        created_ms,
        min_seq,
        max_seq,
        ckpt,
    })
}

impl Wal {
    /// Opens (or resumes) the write-ahead log described by `config`,
    /// stamping new segments with `info`.
    pub fn open(config: &WalConfig, info: &SystemInfoData) -> Result<Self> {
        if !config.enabled {
            return Ok(Self {
                enabled: false,
                base: config.path.clone(),
                state: Mutex::new(WalState {
                    file: None,
                    path: PathBuf::new(),
                    buffer: Vec::new(),
                    min_seq: -1,
                    max_seq: -1,
                    last_ckpt: 0,
                }),
            });
        }

        let dir = config
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).wrapped(ErrorKind::DurabilityFailure)?;

        // resume the newest open segment, if one exists
        let mut open_segment: Option<(SegmentName, PathBuf)> = None;
        for entry in fs::read_dir(dir).wrapped(ErrorKind::DurabilityFailure)? {
            let entry = entry.wrapped(ErrorKind::DurabilityFailure)?;
            let path = entry.path();
            let name = match parse_segment_name(&path) {
                Some(n) => n,
                None => continue,
            };
            if name.min_seq != -1 {
                continue;
            }
            let newer = open_segment
                .as_ref()
                .map(|(cur, _)| name.created_ms > cur.created_ms)
                .unwrap_or(true);
            if newer {
                open_segment = Some((name, path));
            }
        }

        let wal = Self {
            enabled: true,
            base: config.path.clone(),
            state: Mutex::new(WalState {
                file: None,
                path: PathBuf::new(),
                // flushed at every durability boundary; the capacity
                // only bounds the transient block assembly
                buffer: Vec::with_capacity(config.buffer_size),
                min_seq: -1,
                max_seq: -1,
                last_ckpt: 0,
            }),
        };

        {
            let mut state = wal.state.lock();
            match open_segment {
                Some((name, path)) => {
                    // a crash mid-write leaves a torn tail; cut it off
                    // before appending anything after it
                    let raw = fs::read(&path).wrapped(ErrorKind::DurabilityFailure)?;
                    let valid = valid_segment_len(&raw[..]);
                    if valid < raw.len() {
                        warn!(path = %path.display(), "truncating torn wal tail");
                        let file = OpenOptions::new()
                            .write(true)
                            .open(&path)
                            .wrapped(ErrorKind::DurabilityFailure)?;
                        file.set_len(valid as u64)
                            .wrapped(ErrorKind::DurabilityFailure)?;
                        file.sync_data().wrapped(ErrorKind::DurabilityFailure)?;
                    }
                    // recompute the segment's sequence range so the
                    // eventual rotation names it correctly
                    if let Ok((_, records)) = read_segment(&path) {
                        for record in &records {
                            let seq = u64::from(record.request.sequence_number()) as i64;
                            state.min_seq = if state.min_seq == -1 {
                                seq
                            } else {
                                state.min_seq.min(seq)
                            };
                            state.max_seq = state.max_seq.max(seq);
                        }
                    }
                    state.last_ckpt = name.ckpt;
                    state.path = path;
                }
                None => {
                    state.last_ckpt = 0;
                    state.path = wal.segment_path(0, -1, -1);
                }
            }
            wal.open_file(&mut state, info)?;
        }

        Ok(wal)
    }

    fn segment_path(&self, ckpt: i64, min_seq: i64, max_seq: i64) -> PathBuf {
        let dir = self
            .base
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let stem = self
            .base
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("log");
        dir.join(format!(
            "{}_{}_{}_{}_{}.log",
            stem,
            now_ms(),
            min_seq,
            max_seq,
            ckpt
        ))
    }

    fn open_file(&self, state: &mut WalState, info: &SystemInfoData) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&state.path)
            .wrapped(ErrorKind::DurabilityFailure)?;
        let len = file
            .metadata()
            .wrapped(ErrorKind::DurabilityFailure)?
            .len();
        state.file = Some(file);
        debug!(path = %state.path.display(), len, "opened wal segment");

        if len == 0 {
            let header = serialize::serialize(info)?;
            let mut buf = Vec::with_capacity(LEN_PREFIX + header.len());
            buf.extend_from_slice(&(header.len() as u64).to_le_bytes());
            buf.extend_from_slice(&header[..]);
            Self::write_all(state, &buf[..])?;
            Self::fsync(state)?;
        }
        Ok(())
    }

    fn write_all(state: &mut WalState, data: &[u8]) -> Result<()> {
        let file = state
            .file
            .as_mut()
            .ok_or_else(|| Error::simple(ErrorKind::DurabilityFailure))?;
        file.write_all(data).wrapped(ErrorKind::DurabilityFailure)
    }

    fn fsync(state: &mut WalState) -> Result<()> {
        let file = state
            .file
            .as_mut()
            .ok_or_else(|| Error::simple(ErrorKind::DurabilityFailure))?;
        file.sync_data().wrapped(ErrorKind::DurabilityFailure)
    }

    fn push_item(buffer: &mut Vec<u8>, item: &[u8]) {
        buffer.extend_from_slice(&(item.len() as u64).to_le_bytes());
        buffer.extend_from_slice(item);
    }

    // Writes the buffered records as one length prefixed block and
    // syncs the file. Failures here are fatal to the replica.
    fn flush(state: &mut WalState) -> Result<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        let block = std::mem::take(&mut state.buffer);
        let mut framed = Vec::with_capacity(LEN_PREFIX + block.len());
        framed.extend_from_slice(&(block.len() as u64).to_le_bytes());
        framed.extend_from_slice(&block[..]);
        Self::write_all(state, &framed[..])?;
        Self::fsync(state)
    }

    /// Appends one protocol message, together with its envelope
    /// signature and the last executed sequence, then syncs.
    ///
    /// Messages of kinds without durable effects are ignored. An
    /// `Err` from here means the replica must crash-restart so the
    /// log becomes the source of truth.
    pub fn append(
        &self,
        request: &Request,
        signature: Option<&SignatureInfo>,
        last_executed: SeqNo,
    ) -> Result<()> {
        if !self.enabled || !request.kind().is_durable() {
            return Ok(());
        }

        let raw_request = request.canonical_bytes()?;
        let raw_signature = serialize::serialize(&signature.copied())?;
        let raw_executed = u64::from(last_executed).to_string().into_bytes();

        let mut state = self.state.lock();
        let seq = u64::from(request.sequence_number()) as i64;
        state.min_seq = if state.min_seq == -1 {
            seq
        } else {
            state.min_seq.min(seq)
        };
        state.max_seq = state.max_seq.max(seq);

        Self::push_item(&mut state.buffer, &raw_request[..]);
        Self::push_item(&mut state.buffer, &raw_signature[..]);
        Self::push_item(&mut state.buffer, &raw_executed[..]);
        Self::flush(&mut state)
    }

    /// Rotates the open segment when the stable checkpoint advanced:
    /// the live file is renamed to its final range-bearing name, a
    /// fresh segment is opened, and segments entirely below the
    /// stable checkpoint are removed.
    ///
    /// Reports whether a rotation took place.
    pub fn rotate(&self, stable: SeqNo, info: &SystemInfoData) -> Result<bool> {
        if !self.enabled {
            return Ok(false);
        }
        let stable = u64::from(stable) as i64;

        let mut state = self.state.lock();
        if stable == state.last_ckpt {
            return Ok(false);
        }
        if state.min_seq == -1 {
            // nothing was appended to this segment; keep it open
            // under the new checkpoint
            state.last_ckpt = stable;
            return Ok(false);
        }
        Self::flush(&mut state)?;
        state.file = None;

        let final_path = self.segment_path(stable, state.min_seq, state.max_seq);
        fs::rename(&state.path, &final_path).wrapped(ErrorKind::DurabilityFailure)?;
        info!(
            from = %state.path.display(),
            to = %final_path.display(),
            "rotated wal segment"
        );

        state.min_seq = -1;
        state.max_seq = -1;
        state.last_ckpt = stable;
        state.path = self.segment_path(stable, -1, -1);
        self.open_file(&mut state, info)?;

        self.prune_below(stable);
        Ok(true)
    }

    // Removes closed segments whose whole range sits below the
    // stable checkpoint.
    fn prune_below(&self, stable: i64) {
        let dir = match self.base.parent() {
            Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if let Some(name) = parse_segment_name(&path) {
                if name.min_seq != -1 && name.max_seq < stable {
                    if let Err(err) = fs::remove_file(&path) {
                        warn!(path = %path.display(), "failed to prune wal segment: {}", err);
                    }
                }
            }
        }
    }

    /// Replays the log: returns the newest segment header and every
    /// record above the stable checkpoint, oldest first.
    pub fn replay(&self) -> Result<(Option<SystemInfoData>, Vec<WalRecord>)> {
        if !self.enabled {
            return Ok((None, Vec::new()));
        }

        let dir = self
            .base
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let mut last_ckpt = 0i64;
        let mut segments = Vec::new();
        for entry in fs::read_dir(&dir).wrapped(ErrorKind::DurabilityFailure)? {
            let entry = entry.wrapped(ErrorKind::DurabilityFailure)?;
            let path = entry.path();
            if let Some(name) = parse_segment_name(&path) {
                last_ckpt = last_ckpt.max(name.ckpt);
                segments.push((name, path));
            }
        }

        // the closed segments covering the checkpoint, plus the
        // newest open segment
        let mut chosen: Vec<(i64, PathBuf)> = segments
            .iter()
            .filter(|(name, _)| {
                name.min_seq != -1 && name.min_seq <= last_ckpt && name.max_seq >= last_ckpt
            })
            .map(|(name, path)| (name.created_ms, path.clone()))
            .collect();
        let open = segments
            .iter()
            .filter(|(name, _)| name.min_seq == -1)
            .max_by_key(|(name, _)| name.created_ms)
            .map(|(name, path)| (name.created_ms, path.clone()));
        chosen.extend(open);
        chosen.sort();

        let mut system_info = None;
        let mut records = Vec::new();
        for (idx, (_, path)) in chosen.iter().enumerate() {
            let (info, mut segment_records) = read_segment(path)?;
            if idx == 0 {
                system_info = info;
            }
            records.append(&mut segment_records);
        }

        records.retain(|r| u64::from(r.request.sequence_number()) as i64 > last_ckpt);
        Ok((system_info, records))
    }
}

// Reads one segment: the header, then blocks of length prefixed
// {request, signature, last executed} triplets. A torn tail (from a
// crash mid-write) is tolerated by discarding the incomplete block.
fn read_segment(path: &Path) -> Result<(Option<SystemInfoData>, Vec<WalRecord>)> {
    let raw = fs::read(path).wrapped(ErrorKind::DurabilityFailure)?;
    let mut pos = 0usize;

    let header = next_chunk(&raw, &mut pos);
    let system_info = header.and_then(|h| serialize::deserialize(h).ok());

    let mut records = Vec::new();
    while let Some(block) = next_chunk(&raw, &mut pos) {
        let mut block_pos = 0usize;
        loop {
            let raw_request = next_chunk(block, &mut block_pos);
            let raw_signature = next_chunk(block, &mut block_pos);
            let raw_executed = next_chunk(block, &mut block_pos);
            let (raw_request, raw_signature, raw_executed) =
                match (raw_request, raw_signature, raw_executed) {
                    (Some(a), Some(b), Some(c)) => (a, b, c),
                    _ => break,
                };
            let request = match serialize::deserialize_request(raw_request) {
                Ok(r) => r,
                Err(_) => {
                    warn!(path = %path.display(), "undecodable wal record, stopping replay");
                    return Ok((system_info, records));
                }
            };
            let signature: Option<SignatureInfo> =
                serialize::deserialize(raw_signature).unwrap_or(None);
            let last_executed_seq = std::str::from_utf8(raw_executed)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            records.push(WalRecord {
                request,
                signature,
                last_executed_seq,
            });
        }
    }
    Ok((system_info, records))
}

// Byte length of the valid prefix of a segment: the header plus
// every complete block.
fn valid_segment_len(raw: &[u8]) -> usize {
    let mut pos = 0usize;
    if next_chunk(raw, &mut pos).is_none() {
        return 0;
    }
    let mut valid = pos;
    while next_chunk(raw, &mut pos).is_some() {
        valid = pos;
    }
    valid
}

// Pops one `[len][bytes]` chunk, or `None` on a torn or finished
// buffer.
fn next_chunk<'a>(raw: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    if raw.len() - *pos < LEN_PREFIX {
        return None;
    }
    let mut prefix = [0u8; LEN_PREFIX];
    prefix.copy_from_slice(&raw[*pos..*pos + LEN_PREFIX]);
    let len = u64::from_le_bytes(prefix) as usize;
    *pos += LEN_PREFIX;
    if raw.len() - *pos < len {
        return None;
    }
    let chunk = &raw[*pos..*pos + len];
    *pos += len;
    Some(chunk)
}
