//! Return codes
//!
//! Stable integers shared with the converter binary and with whoever reads the
//! reply queue. Values must never be renumbered.

/// Success
pub const OK: i32 = 0;
/// Unknown error, also used when a process ends without an exit code
pub const UNKNOWN: i32 = 4;
/// Converter failed to finish (crashed or could not be launched)
pub const CONVERTER_CRASH: i32 = 12;
/// Failed to read import parameters for the asset-bundle build
pub const PARAM_READ_FAIL: i32 = 13;
/// Asset-bundle generation failed
pub const BUNDLE_GEN_FAIL: i32 = 14;
/// Failed to read the command or its parameter file
pub const ARG_FILE_FAIL: i32 = 16;
/// Process exceeded its time budget and was killed
pub const TIMEOUT: i32 = 29;
/// Toy model import (or its follow-up tree generation) failed
pub const TOY_IMPORT_FAILED: i32 = 33;
/// The converter or the bundle build rejected the licence
pub const LICENCE_INVALID: i32 = 35;

/// Exit codes that still let a pipeline carry on (missing textures, missing
/// nodes, untriangulated meshes). The numeric code is still reported.
pub const DEFAULT_SOFT_FAILS: [i32; 3] = [7, 10, 15];

/// Returns a short description of a return code for log lines
pub fn describe(code: i32) -> &'static str {
    match code {
        OK => "ok",
        UNKNOWN => "unknown error",
        7 => "scene loaded with missing textures",
        10 => "scene loaded with missing nodes",
        CONVERTER_CRASH => "converter crashed",
        PARAM_READ_FAIL => "failed to read import parameters",
        BUNDLE_GEN_FAIL => "failed to generate asset bundles",
        15 => "scene loaded with invalid meshes",
        ARG_FILE_FAIL => "failed to read command arguments",
        TIMEOUT => "process timed out",
        TOY_IMPORT_FAILED => "toy model import failed",
        LICENCE_INVALID => "invalid licence",
        _ => "converter error",
    }
}
