//! Core types shared by the cintel daemon, its worker helper and the wire
//! layer: configuration, compile-command parsing, translation units, index
//! payloads and the file-id interning table.

pub mod config;
pub mod files;
pub mod index_data;
pub mod snapshot;
pub mod source;
pub mod unit;

pub use config::{DaemonOptions, default_data_dir, default_socket_path};
pub use files::FileTable;
pub use index_data::{Diagnostic, DiagnosticKind, IndexData, Location, Symbol, SymbolKind};
pub use source::{Language, Source};
pub use unit::Unit;

/// Bumped whenever the on-disk layout of snapshots or the fileids table
/// changes. A mismatch on restore deletes the file.
pub const DATABASE_VERSION: i32 = 7;
