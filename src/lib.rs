/// Incremental CRC-32 in the variant the DFU suffix uses.
pub mod crc;

/// Enumerate DFU-capable USB devices, match them against user filters, and
/// drive the run-time to DFU mode transition.
pub mod device;

/// DfuSe (ST extension) engine: memory-targeted erase/write, special
/// commands, and the DfuSe container file format.
pub mod dfuse;

/// Load and store firmware files carrying a DFU suffix and optional
/// TI Stellaris / NXP LPC vendor prefixes.
pub mod dfu_file;

/// Error taxonomy shared by the library and the command-line tools.
pub mod error;

/// Parse the DfuSe memory layout advertised in altsetting name strings.
pub mod memory;

/// Report transfer progress to a pluggable sink.
pub mod progress;

/// DFU class requests, device status records, and the idle-entry state
/// machine.
pub mod protocol;

/// Quirk lookup for devices that deviate from the DFU specification.
pub mod quirks;

/// Paged upload and download loops for plain (non-DfuSe) DFU.
pub mod transfer;
