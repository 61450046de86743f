//! Rendering packs through `nomad-pack`.
//!
//! - `pty`: terminal channel the renderer writes into
//! - `renderer`: builds the command line, runs it, collects output
//! - `parser`: splits the transcript into files

mod parser;
mod pty;
mod renderer;

pub use parser::{parse_rendered_output, JobFiles, BOLD_END, BOLD_START};
pub use pty::{read_transcript, TerminalChannel, TerminalSize};
pub use renderer::{
    NomadPackRenderer, PackRenderer, RenderRequest, RendererConfig, DEFAULT_TIMEOUT_SECS,
};
