//! KSC Code Generation
//!
//! This crate handles:
//! - The backend-supportability gate shared by every target
//! - C++/STL17 header+source emission
//! - Python, Ruby, Lua and Wireshark-Lua module emission
//! - Output path construction and deterministic file writes

use std::fs;
use std::path::{Path, PathBuf};

use ksc_ir::Spec;
use thiserror::Error;
use tracing::debug;

pub mod cpp;
pub mod lua;
pub mod python;
pub mod resolve;
pub mod ruby;
pub mod scope;
pub mod support;

/// Errors that can occur while gating or emitting code
#[derive(Debug, Error)]
pub enum CodegenError {
    /// The selected backend cannot render this construct yet
    #[error("not yet supported: {0}")]
    NotYetSupported(String),

    /// An output file could not be created or written
    #[error("failed to open output file: {0}")]
    OpenOutput(String),

    /// The output directory tree could not be created
    #[error("failed to create output directory: {0}")]
    CreateOutputDir(String),
}

/// Result type for codegen operations
pub type Result<T> = std::result::Result<T, CodegenError>;

/// Code generation target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    CppStl,
    Python,
    Ruby,
    Lua,
    WiresharkLua,
}

impl Target {
    pub const ALL: [Target; 5] = [
        Target::CppStl,
        Target::Python,
        Target::Ruby,
        Target::Lua,
        Target::WiresharkLua,
    ];

    pub fn parse(name: &str) -> Option<Target> {
        match name {
            "cpp_stl" => Some(Target::CppStl),
            "python" => Some(Target::Python),
            "ruby" => Some(Target::Ruby),
            "lua" => Some(Target::Lua),
            "wireshark_lua" => Some(Target::WiresharkLua),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Target::CppStl => "cpp_stl",
            Target::Python => "python",
            Target::Ruby => "ruby",
            Target::Lua => "lua",
            Target::WiresharkLua => "wireshark_lua",
        }
    }
}

/// Options a single emit invocation depends on.
#[derive(Debug, Clone, Default)]
pub struct EmitOptions {
    pub out_dir: PathBuf,
    /// Package path for Python output; dots become directories.
    pub python_package: Option<String>,
}

/// Gate the spec for the target, render it, and write the output files.
/// Given identical IR and options the written bytes are identical across
/// runs and platforms.
pub fn emit(spec: &Spec, target: Target, options: &EmitOptions) -> Result<()> {
    support::check(spec)?;
    debug!(spec = %spec.name, target = target.as_str(), "emitting");
    match target {
        Target::CppStl => {
            create_dirs(&options.out_dir)?;
            write_file(
                &options.out_dir.join(format!("{}.h", spec.name)),
                &cpp::render_header(spec),
            )?;
            write_file(
                &options.out_dir.join(format!("{}.cpp", spec.name)),
                &cpp::render_source(spec),
            )
        }
        Target::Python => write_module(&python_output_path(spec, options), &python::render_module(spec)),
        Target::Ruby => write_module(
            &options.out_dir.join(format!("{}.rb", spec.name)),
            &ruby::render_module(spec),
        ),
        Target::Lua => write_module(
            &options.out_dir.join(format!("{}.lua", spec.name)),
            &lua::render_module(spec, false),
        ),
        Target::WiresharkLua => write_module(
            &options.out_dir.join(format!("{}_wireshark.lua", spec.name)),
            &lua::render_module(spec, true),
        ),
    }
}

fn python_output_path(spec: &Spec, options: &EmitOptions) -> PathBuf {
    let file = format!("{}.py", spec.name);
    match options.python_package.as_deref() {
        None | Some("") => options.out_dir.join(file),
        Some(package) => options
            .out_dir
            .join(package.replace('.', "/"))
            .join(file),
    }
}

fn create_dirs(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| CodegenError::CreateOutputDir(e.to_string()))
}

fn write_module(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dirs(parent)?;
    }
    write_file(path, content)
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).map_err(|_| CodegenError::OpenOutput(path.display().to_string()))
}
