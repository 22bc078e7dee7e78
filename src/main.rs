//! Counts the distinct IPv4 addresses in a file holding one dotted-quad per line.
//! Every worker fills a private bitmap covering the whole address space from its own
//! byte range of the file; the bitmaps are then OR-ed together and the set bits counted.

use std::{
    fs::File,
    io::{self, BufRead, BufReader, Read, Seek, SeekFrom},
    num::NonZeroUsize,
    ops::Deref,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::mpsc,
    thread,
    time::Instant,
};

use bitmap::Bitmap;
use clap::Parser;
use log::{debug, error, info, trace, warn};
use memmap2::MmapOptions;
use thiserror::Error;

/// Longest line accepted, not counting the terminator
const MAX_LINE_LEN: usize = 4096;
const READ_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// File with one IPv4 address per line
    #[arg(default_value = "ip_addresses")]
    path: PathBuf,

    /// Number of workers, defaults to the available parallelism
    #[arg(short, long)]
    workers: Option<NonZeroUsize>,

    /// Read through buffered file handles instead of memory-mapping the input
    #[arg(long)]
    no_mmap: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn main() -> ExitCode {
    let args = CliArgs::parse();

    let level = match (args.quiet, args.verbose) {
        (true, _) => simplelog::LevelFilter::Error,
        (false, 0) => simplelog::LevelFilter::Info,
        (false, 1) => simplelog::LevelFilter::Debug,
        (false, _) => simplelog::LevelFilter::Trace,
    };
    if let Err(e) = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    ) {
        eprintln!("couldn't set up logging: {e}");
    }

    let start = Instant::now();

    let num_workers = args.workers.unwrap_or_else(|| {
        if let Ok(n) = thread::available_parallelism() {
            n
        } else {
            warn!("couldn't query the available parallelism, going single-threaded");
            NonZeroUsize::MIN
        }
    });
    info!("using {num_workers} workers");

    let view = if args.no_mmap {
        InputView::Reader
    } else {
        InputView::Mapped
    };

    match count_unique(&args.path, num_workers, view) {
        Ok(total) => {
            println!("{total}");
            info!("total unique IP addresses: {total}");
            info!("total time elapsed: {:?}", start.elapsed());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("processing failed: {e}");
            ExitCode::FAILURE
        }
    }
}

#[derive(Error, Debug)]
enum CountError {
    #[error("failed to open input file: {0}")]
    Open(#[source] io::Error),
    #[error("failed to stat input file: {0}")]
    Stat(#[source] io::Error),
    #[error("failed to map input file: {0}")]
    Map(#[source] io::Error),
    #[error("worker {worker} failed: {source}")]
    Worker {
        worker: usize,
        #[source]
        source: ChunkError,
    },
    #[error("worker {worker} panicked")]
    WorkerPanicked { worker: usize },
}

#[derive(Error, Debug)]
enum ChunkError {
    #[error("failed to open file: {0}")]
    Open(#[source] io::Error),
    #[error("failed to seek in file: {0}")]
    Seek(#[source] io::Error),
    #[error("error reading line: {0}")]
    Read(#[source] io::Error),
    #[error("line too long at byte {offset}")]
    LineTooLong { offset: u64 },
}

/// How workers get at the bytes of the input file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InputView {
    /// One shared read-only memory map; each worker walks its own cursor over it
    Mapped,
    /// Each worker opens, seeks and buffers its own file handle
    Reader,
}

/// Opens `path`, splits it into one byte range per worker, scans the ranges in parallel and
/// returns the number of distinct addresses seen across all of them.
/// Fails on the first worker error; no partial count is produced.
fn count_unique(
    path: &Path,
    num_workers: NonZeroUsize,
    view: InputView,
) -> Result<u64, CountError> {
    let file = File::open(path).map_err(CountError::Open)?;
    let file_size = file.metadata().map_err(CountError::Stat)?.len();
    debug!("{} is {file_size} bytes", path.display());

    let merged = match view {
        InputView::Mapped => {
            if file_size == 0 {
                debug!("empty input, nothing to map");
                return Ok(0);
            }
            // SAFETY: the input is only ever read, and is expected not to be modified while
            // it is being counted.
            let mmap = unsafe { MmapOptions::new().map(&file).map_err(CountError::Map)? };
            let input: &[u8] = mmap.deref();
            let offsets = partition(input.len() as u64, num_workers);
            debug!("chunk offsets: {offsets:?}");
            run_workers(&offsets, |range| {
                process_chunk(SliceLines::new(input, range.origin()), range)
            })?
        }
        InputView::Reader => {
            drop(file);
            let offsets = partition(file_size, num_workers);
            debug!("chunk offsets: {offsets:?}");
            run_workers(&offsets, |range| {
                process_chunk(ReaderLines::open(path, range.origin())?, range)
            })?
        }
    };

    Ok(merged.popcount())
}

/// Splits `file_size` bytes into `num_workers` ranges, returning the `num_workers + 1` cut points.
/// Cuts ignore line boundaries; each worker realigns its own start.
fn partition(file_size: u64, num_workers: NonZeroUsize) -> Vec<u64> {
    let n = num_workers.get() as u64;
    let chunk_size = file_size / n;
    let mut offsets: Vec<u64> = (0..n).map(|i| i * chunk_size).collect();
    offsets.push(file_size);
    offsets
}

/// Byte range `[start, end)` of the input owned by one worker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ChunkRange {
    start: u64,
    end: u64,
}

impl ChunkRange {
    fn from_offsets(offsets: &[u64]) -> impl Iterator<Item = ChunkRange> + '_ {
        offsets.windows(2).map(|w| ChunkRange {
            start: w[0],
            end: w[1],
        })
    }

    /// Where reading begins. Every range but the first starts one byte early, so the partial
    /// line it discards ends at the first newline at or after `start - 1`. A cut landing exactly
    /// on a line start then discards only the preceding newline.
    fn origin(self) -> u64 {
        self.start.saturating_sub(1)
    }
}

/// Spawns one worker per range and OR-merges their bitmaps as they arrive.
/// Returns the first worker failure, if any, once the remaining workers have finished.
fn run_workers<F>(offsets: &[u64], process: F) -> Result<Bitmap, CountError>
where
    F: Fn(ChunkRange) -> Result<ChunkScan, ChunkError> + Sync,
{
    thread::scope(|s| {
        let (tx, rx) = mpsc::channel();
        let mut handles = Vec::with_capacity(offsets.len().saturating_sub(1));

        for (worker, range) in ChunkRange::from_offsets(offsets).enumerate() {
            let tx = tx.clone();
            let process = &process;
            handles.push(s.spawn(move || {
                let result = process(range);
                if let Ok(scan) = &result {
                    debug!(
                        "worker {worker} scanned {} lines ({} bytes) in {range:?}",
                        scan.lines, scan.bytes
                    );
                }
                // left unread once a sibling has failed
                let _ = tx.send((worker, result));
            }));
        }
        drop(tx);

        let mut failure = None;
        let mut received = 0;
        let merged = bitmap::merge(rx.iter().map_while(|(worker, result)| match result {
            Ok(scan) => {
                received += 1;
                trace!("merging bitmap from worker {worker}");
                Some(scan.bitmap)
            }
            Err(source) => {
                failure = Some(CountError::Worker { worker, source });
                None
            }
        }));
        if let Some(e) = failure {
            // joined here so a sibling's panic can't abort the scope before the error is reported
            for handle in handles {
                let _ = handle.join();
            }
            return Err(e);
        }

        // every sender is gone, so any worker that didn't report must have panicked
        if received < handles.len() {
            for (worker, handle) in handles.into_iter().enumerate() {
                if handle.join().is_err() {
                    return Err(CountError::WorkerPanicked { worker });
                }
            }
        }

        Ok(merged)
    })
}

/// What one worker hands back for merging
struct ChunkScan {
    bitmap: Bitmap,
    lines: u64,
    /// Bytes consumed from `range.origin()`, discarded fragment included
    bytes: u64,
}

/// A forward-only source of lines, each returned without its `\n` or `\r\n` terminator.
/// The final line of the input need not be terminated; a lone `\r` there is kept.
trait LineSource {
    /// Byte offset in the file of the next unread byte
    fn position(&self) -> u64;

    fn next_line(&mut self) -> Result<Option<&[u8]>, ChunkError>;
}

/// Scans the lines of `range` from `lines`, which must be positioned at `range.origin()`.
///
/// A range not starting at 0 first discards the line fragment that belongs to the previous
/// range. Lines are then read while the cursor is before `range.end`, so the line straddling
/// `end` is read here in full and discarded by the next range. Malformed lines are skipped.
fn process_chunk(mut lines: impl LineSource, range: ChunkRange) -> Result<ChunkScan, ChunkError> {
    debug_assert_eq!(lines.position(), range.origin());

    let mut bitmap = Bitmap::new();
    let mut line_count = 0;

    if range.start != 0 && lines.next_line()?.is_none() {
        return Ok(ChunkScan {
            bitmap,
            lines: line_count,
            bytes: lines.position() - range.origin(),
        });
    }

    while lines.position() < range.end {
        let Some(line) = lines.next_line()? else {
            break;
        };
        line_count += 1;
        if let Ok(addr) = parse_ipv4(line) {
            bitmap.set(addr);
        }
    }

    Ok(ChunkScan {
        bitmap,
        lines: line_count,
        bytes: lines.position() - range.origin(),
    })
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.split_last() {
        Some((&b'\r', rest)) => rest,
        _ => line,
    }
}

/// Lines out of a byte slice, typically a memory map of the whole input
struct SliceLines<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> SliceLines<'a> {
    fn new(input: &'a [u8], origin: u64) -> Self {
        Self {
            input,
            pos: (origin as usize).min(input.len()),
        }
    }
}

impl LineSource for SliceLines<'_> {
    fn position(&self) -> u64 {
        self.pos as u64
    }

    fn next_line(&mut self) -> Result<Option<&[u8]>, ChunkError> {
        let input = self.input;
        let rest = &input[self.pos..];
        if rest.is_empty() {
            return Ok(None);
        }

        let (line, consumed) = if let Some(newline_pos) = rest
            .iter()
            .take(MAX_LINE_LEN + 1)
            .position(|b| *b == b'\n')
        {
            (strip_cr(&rest[..newline_pos]), newline_pos + 1)
        } else if rest.len() <= MAX_LINE_LEN {
            // unterminated last line
            (rest, rest.len())
        } else {
            return Err(ChunkError::LineTooLong {
                offset: self.pos as u64,
            });
        };

        self.pos += consumed;
        Ok(Some(line))
    }
}

/// Lines out of an independently opened, buffered handle on the input file
struct ReaderLines {
    reader: BufReader<File>,
    pos: u64,
    buf: Vec<u8>,
}

impl ReaderLines {
    fn open(path: &Path, origin: u64) -> Result<Self, ChunkError> {
        let mut file = File::open(path).map_err(ChunkError::Open)?;
        file.seek(SeekFrom::Start(origin))
            .map_err(ChunkError::Seek)?;
        Ok(Self {
            reader: BufReader::with_capacity(READ_BUFFER_SIZE, file),
            pos: origin,
            buf: Vec::with_capacity(MAX_LINE_LEN + 1),
        })
    }
}

impl LineSource for ReaderLines {
    fn position(&self) -> u64 {
        self.pos
    }

    fn next_line(&mut self) -> Result<Option<&[u8]>, ChunkError> {
        self.buf.clear();
        let consumed = (&mut self.reader)
            .take(MAX_LINE_LEN as u64 + 1)
            .read_until(b'\n', &mut self.buf)
            .map_err(ChunkError::Read)?;
        if consumed == 0 {
            return Ok(None);
        }

        let line = match self.buf.split_last() {
            Some((&b'\n', line)) => strip_cr(line),
            _ if consumed > MAX_LINE_LEN => {
                return Err(ChunkError::LineTooLong { offset: self.pos });
            }
            // unterminated last line
            _ => &self.buf[..],
        };

        self.pos += consumed as u64;
        Ok(Some(line))
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
enum AddrParseError {
    #[error("octet value above 255")]
    OctetOutOfRange,
    #[error("octet longer than three digits")]
    OctetTooLong,
    #[error("empty octet")]
    EmptyOctet,
    #[error("more than four octets")]
    TooManyOctets,
    #[error("fewer than four octets")]
    TooFewOctets,
    #[error("invalid character")]
    InvalidCharacter,
}

/// Parses a dotted-quad such as `192.168.1.1` into its big-endian `u32` form in a single pass.
/// Each octet must be 1 to 3 digits with a value of at most 255; leading zeros are allowed.
fn parse_ipv4(line: &[u8]) -> Result<u32, AddrParseError> {
    let mut addr = 0u32;
    let mut octet = 0u32;
    let mut digits = 0u32;
    let mut dots = 0u32;

    for &b in line {
        match b {
            b'0'..=b'9' => {
                octet = octet * 10 + (b - b'0') as u32;
                digits += 1;
                if octet > 255 {
                    return Err(AddrParseError::OctetOutOfRange);
                }
                if digits > 3 {
                    return Err(AddrParseError::OctetTooLong);
                }
            }
            b'.' => {
                if digits == 0 {
                    return Err(AddrParseError::EmptyOctet);
                }
                if dots == 3 {
                    return Err(AddrParseError::TooManyOctets);
                }
                addr |= octet << (24 - 8 * dots);
                octet = 0;
                digits = 0;
                dots += 1;
            }
            _ => return Err(AddrParseError::InvalidCharacter),
        }
    }

    if dots != 3 {
        return Err(AddrParseError::TooFewOctets);
    }
    if digits == 0 {
        return Err(AddrParseError::EmptyOctet);
    }
    Ok(addr | octet)
}

/// A presence bitmap over the whole IPv4 address space
mod bitmap {
    /// 2^32 bits in `u64` words
    pub const WORD_COUNT: usize = 1 << 26;

    /// 2^32 bits, 512 MiB. Allocated zeroed, so pages a worker never touches are never
    /// backed by memory.
    pub struct Bitmap {
        words: Box<[u64]>,
    }

    impl Bitmap {
        pub fn new() -> Self {
            Self {
                words: vec![0u64; WORD_COUNT].into_boxed_slice(),
            }
        }

        #[inline]
        pub fn set(&mut self, addr: u32) {
            let idx = (addr >> 6) as usize;
            // SAFETY: `addr >> 6` < 2^26 == WORD_COUNT, and `words` always holds WORD_COUNT words
            unsafe {
                *self.words.get_unchecked_mut(idx) |= 1 << (addr & 63);
            }
        }

        #[cfg(test)]
        pub fn contains(&self, addr: u32) -> bool {
            self.words[(addr >> 6) as usize] & (1 << (addr & 63)) != 0
        }

        /// Number of set bits, i.e. distinct addresses recorded
        pub fn popcount(&self) -> u64 {
            self.words.iter().map(|w| w.count_ones() as u64).sum()
        }

        /// ORs `other` into `self`. Zero words of `other` are skipped so that untouched pages
        /// of `self` stay unbacked.
        pub fn union_with(&mut self, other: &Bitmap) {
            for (dst, src) in self.words.iter_mut().zip(other.words.iter()) {
                if *src != 0 {
                    *dst |= *src;
                }
            }
        }
    }

    impl Default for Bitmap {
        fn default() -> Self {
            Self::new()
        }
    }

    /// OR-reduces `bitmaps`, consuming and freeing each one as soon as it is folded in
    pub fn merge(bitmaps: impl IntoIterator<Item = Bitmap>) -> Bitmap {
        let mut bitmaps = bitmaps.into_iter();
        let Some(mut merged) = bitmaps.next() else {
            return Bitmap::new();
        };
        for bitmap in bitmaps {
            merged.union_with(&bitmap);
        }
        merged
    }
}
