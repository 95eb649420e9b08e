#[macro_export]
macro_rules! log_or_err {
    ($state:expr, $level:expr, $err:expr $(,)?) => {{
        if $level <= $state.fail_level {
            return Err($err);
        } else {
            match $level {
                ::log::Level::Error => ::log::error!("{}", $err),
                ::log::Level::Warn => ::log::warn!("{}", $err),
                ::log::Level::Info => ::log::info!("{}", $err),
                ::log::Level::Debug => ::log::debug!("{}", $err),
                ::log::Level::Trace => ::log::trace!("{}", $err),
            }
        }
    }};
}

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("Cannot rewind a non-seekable source past the discard point ({requested} < {discard})")]
    RewindPastDiscard { requested: u64, discard: u64 },

    #[error("Cache window cannot grow to {needed} bytes (cap {cap})")]
    WindowCapacityExceeded { needed: usize, cap: usize },

    #[error("Cache is locked by another owner")]
    LockHeldElsewhere,

    #[error("I/O error while filling cache: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum PageError {
    #[error("Capture pattern mismatch, read {0:#010X}")]
    MissingCapture(u32),

    #[error("Unsupported Ogg stream structure version {0}")]
    UnsupportedVersion(u8),

    #[error("Page CRC mismatch. Calculated {calculated:#010X}, Read {read:#010X}")]
    CrcMismatch { calculated: u32, read: u32 },

    #[error("No page capture within the resync window ({0} bytes scanned)")]
    ResyncLimitExceeded(usize),

    #[error("Page truncated by end of container")]
    TruncatedPage,

    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(thiserror::Error, Debug)]
pub enum PacketError {
    #[error("Continuation packet without a preceding partial packet")]
    OrphanContinuation,

    #[error("Packet is incomplete (final fragment never arrived)")]
    Incomplete,

    #[error(transparent)]
    Page(#[from] PageError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(thiserror::Error, Debug)]
pub enum HeaderError {
    #[error("Unexpected header packet type: expected {expected}, read {read}")]
    BadPacketType { expected: u8, read: u8 },

    #[error("Header packet missing the codec signature")]
    MissingSignature,

    #[error("Unsupported Vorbis version {0}")]
    UnsupportedStreamVersion(u32),

    #[error("Channel count must be nonzero")]
    InvalidChannelCount,

    #[error("Sample rate must be nonzero")]
    InvalidSampleRate,

    #[error("Invalid block sizes: {block0}, {block1}")]
    InvalidBlockSize { block0: u32, block1: u32 },

    #[error("Framing bit missing at end of header")]
    MissingFramingBit,

    #[error("Time backend {index} must be the zero placeholder, read {value}")]
    TimePlaceholderNonZero { index: usize, value: u16 },

    #[error("Comments header truncated")]
    TruncatedComments,
}

#[derive(thiserror::Error, Debug)]
pub enum CodebookError {
    #[error("Codebook sync pattern mismatch, read {0:#08X}")]
    BadSyncPattern(u32),

    #[error("Codeword assignment overran the available code space")]
    InvalidTree,

    #[error("Unsupported codebook lookup type {0}")]
    InvalidLookupType(u8),

    #[error("Codebook {0} has no vector lookup table")]
    MissingLookupTable(usize),
}

#[derive(thiserror::Error, Debug)]
pub enum FloorError {
    #[error("Unsupported floor type {0}")]
    UnsupportedType(u16),

    #[error("Floor 0 parameters out of range")]
    InvalidParameters,

    #[error("Floor 1 point list is too long ({0} points)")]
    TooManyPoints(usize),

    #[error("Floor 0 references invalid codebook {0}")]
    InvalidBook(u8),

    #[error("Floor 1 point list contains duplicate x position {0}")]
    DuplicatePoint(u32),

    #[error("Floor 1 references invalid codebook {0}")]
    InvalidClassBook(u8),
}

#[derive(thiserror::Error, Debug)]
pub enum ResidueError {
    #[error("Unsupported residue type {0}")]
    UnsupportedType(u16),

    #[error("Residue references invalid classification codebook {0}")]
    InvalidClassbook(u8),

    #[error("Residue classification count {partvals} exceeds classbook entries {entries}")]
    PartitionOverflow { partvals: u64, entries: u32 },

    #[error("Residue references invalid codebook {0}")]
    InvalidBook(u8),

    #[error("Residue codebook {0} lacks a vector lookup table")]
    MissingLookup(u8),

    #[error("Residue codebook {0} has zero dimensions")]
    ZeroDimensionBook(u8),
}

#[derive(thiserror::Error, Debug)]
pub enum MappingError {
    #[error("Unsupported mapping type {0}")]
    UnsupportedType(u16),

    #[error("Invalid coupling step: magnitude {magnitude}, angle {angle}")]
    InvalidCouplingChannel { magnitude: u32, angle: u32 },

    #[error("Reserved mapping bits must be zero")]
    ReservedBitsNonZero,

    #[error("Channel {channel} multiplexed to invalid submap {mux}")]
    InvalidMux { channel: usize, mux: u8 },

    #[error("Submap references invalid floor {0}")]
    InvalidSubmapFloor(u8),

    #[error("Submap references invalid residue {0}")]
    InvalidSubmapResidue(u8),
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("Stream headers are not complete")]
    HeadersNotComplete,

    #[error("Mode window type {0} is reserved")]
    UnsupportedWindowType(u16),

    #[error("Mode transform type {0} is reserved")]
    UnsupportedTransformType(u16),

    #[error("Mode references invalid mapping {0}")]
    InvalidMapping(u8),

    #[error("Audio packet selects invalid mode {0}")]
    InvalidMode(usize),

    #[error("A parameter change is pending; acknowledge it before reading further")]
    ParameterChangePending,

    #[error(transparent)]
    Header(#[from] HeaderError),

    #[error(transparent)]
    Codebook(#[from] CodebookError),

    #[error(transparent)]
    Floor(#[from] FloorError),

    #[error(transparent)]
    Residue(#[from] ResidueError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("Decoder error: {0}")]
    Other(#[from] anyhow::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum SeekError {
    #[error("Source does not support seeking")]
    Unseekable,

    #[error("Seek target {0} is outside the stream")]
    TargetOutOfRange(i64),

    #[error("Could not locate a packet containing sample {0}")]
    PacketNotFound(u64),

    #[error("Packet index {0} is beyond the end of the stream")]
    PacketIndexOutOfRange(usize),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Top-level error for the file reading facade.
#[derive(thiserror::Error, Debug)]
pub enum VorbisError {
    #[error("Could not capture an Ogg page at the start of the source")]
    InvalidContainer,

    #[error("No decodable audio streams found")]
    NoStreamsFound,

    #[error("Stream index {0} does not exist")]
    InvalidStreamIndex(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Seek(#[from] SeekError),
}
