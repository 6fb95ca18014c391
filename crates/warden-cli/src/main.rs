//! `warden run <script>` — compile a guest script and drive it through the
//! same calling convention as the original `spec/run.c`: whichever of the
//! well-known `call_*`/`test` functions the script defines gets invoked in
//! turn, and a string result is printed with its `"ok"`-ness mapped to the
//! process exit code.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use warden_backend::HostCallback;
use warden_config::WardenConfig;
use warden_sandbox::BoundedAllocator;
use warden_supervisor::{spawn, ProcessConfig};
use warden_toybackend::ToyBackend;
use warden_value::Value;

/// Installed process-wide so `warden_sandbox::set_memory_budget` (called by
/// `warden_sandbox::lockdown` post-fork, inside the guest) actually bounds
/// real allocations instead of just updating bookkeeping nobody reads. This
/// is the only place it can go — `#[global_allocator]` is a whole-binary
/// choice, and `warden-cli` is the workspace's only binary.
#[global_allocator]
static ALLOCATOR: BoundedAllocator = BoundedAllocator::new();

#[derive(Debug, Parser)]
#[command(name = "warden", version, about = "Run a guest script in a sandboxed host process")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Compile and run a guest script.
    Run {
        /// Path to the script to run.
        script: PathBuf,
        /// Run the guest in-process, without forking a sandboxed child.
        #[arg(short = 'u', long)]
        unsandboxed: bool,
        /// Override the config file's timeout, in seconds.
        #[arg(long)]
        timeout: Option<u64>,
        /// Override the config file's memory budget, in bytes.
        #[arg(long)]
        max_memory: Option<usize>,
        /// Path to a warden.toml config file.
        #[arg(long, default_value = "warden.toml")]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { script, unsandboxed, timeout, max_memory, config } => {
            run(script, unsandboxed, timeout, max_memory, config)
        }
    }
}

/// The host function the original `spec/run.c` example registers: build a
/// `width`-by-`height` grid of `x*10+y` values as nested arrays.
fn get_array_callback() -> HostCallback {
    Box::new(|args| {
        let items = match args.as_array() {
            Some(items) if items.len() == 2 => items,
            _ => return Value::empty_array(),
        };
        let (Some(width), Some(height)) = (items[0].as_i32(), items[1].as_i32()) else {
            return Value::empty_array();
        };
        let mut columns = Vec::with_capacity(width.max(0) as usize);
        for x in 0..width {
            let mut column = Vec::with_capacity(height.max(0) as usize);
            for y in 0..height {
                column.push(Value::Int32(x * 10 + y));
            }
            columns.push(Value::array(column).unwrap_or_else(Value::empty_array));
        }
        Value::array(columns).unwrap_or_else(Value::empty_array)
    })
}

/// The fixed dispatch table from `spec/run.c`: each recognized function name
/// paired with the argument array it is invoked with, in invocation order.
/// The last one found whose function exists wins, matching the original's
/// "keep overwriting `ret`" behavior.
fn dispatch_table() -> Vec<(&'static str, Value)> {
    vec![
        ("call_noargs", Value::empty_array()),
        ("call_int", Value::array(vec![Value::Int32(0)]).unwrap()),
        ("call_float", Value::array(vec![Value::Float32(0.0)]).unwrap()),
        ("call_string", Value::array(vec![Value::string("foobar").unwrap()]).unwrap()),
        ("call_boolean", Value::array(vec![Value::Bool(false)]).unwrap()),
        (
            "call_array",
            Value::array(vec![Value::array(vec![
                Value::Int32(1),
                Value::Int32(2),
                Value::Int32(3),
            ])
            .unwrap()])
            .unwrap(),
        ),
        (
            "call_int_and_float_and_string",
            Value::array(vec![
                Value::Int32(1),
                Value::Float32(2.0),
                Value::string("ok").unwrap(),
            ])
            .unwrap(),
        ),
        (
            "call_boolean_and_array",
            Value::array(vec![Value::Bool(true), Value::empty_array()]).unwrap(),
        ),
        ("test", Value::empty_array()),
    ]
}

fn run(
    script_path: PathBuf,
    unsandboxed: bool,
    timeout_override: Option<u64>,
    max_memory_override: Option<usize>,
    config_path: PathBuf,
) -> Result<()> {
    let mut config = WardenConfig::load_from(&config_path)?;
    if let Some(t) = timeout_override {
        config.proxy.timeout_seconds = t;
    }
    if let Some(m) = max_memory_override {
        config.sandbox.max_memory_bytes = m;
    }

    let script = fs::read(&script_path)
        .with_context(|| format!("reading script {}", script_path.display()))?;

    let cfg = ProcessConfig {
        timeout: config.timeout(),
        max_memory: config.sandbox.max_memory_bytes,
        syscall_blacklist: config.resolved_blacklist(),
        sandboxed: !unsandboxed && config.sandbox.enabled,
    };

    let mut process = spawn(ToyBackend::new(), &cfg)?;
    process.define_function("get_array", get_array_callback()).ok();

    if !process.compile_script(&script) {
        eprintln!("error compiling script");
        process.destroy();
        std::process::exit(1);
    }

    let mut result = Value::Void;
    for (name, args) in dispatch_table() {
        if process.is_function(name) {
            result = process.call_function(name, args);
        }
    }

    process.destroy();

    match result.as_str() {
        Some(text) => {
            println!("{text}");
            if text == "ok" {
                Ok(())
            } else {
                std::process::exit(1);
            }
        }
        None => {
            println!("{result:?}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_array_builds_the_expected_grid() {
        let mut callback = get_array_callback();
        let result = callback(Value::array(vec![Value::Int32(2), Value::Int32(3)]).unwrap());
        let columns = result.as_array().unwrap();
        assert_eq!(columns.len(), 2);
        let first_column = columns[0].as_array().unwrap();
        assert_eq!(first_column.len(), 3);
        assert_eq!(first_column[0].as_i32(), Some(0));
        assert_eq!(first_column[2].as_i32(), Some(2));
        let second_column = columns[1].as_array().unwrap();
        assert_eq!(second_column[0].as_i32(), Some(10));
    }

    #[test]
    fn dispatch_table_covers_every_call_convention_name() {
        let names: Vec<&str> = dispatch_table().into_iter().map(|(name, _)| name).collect();
        assert_eq!(
            names,
            vec![
                "call_noargs",
                "call_int",
                "call_float",
                "call_string",
                "call_boolean",
                "call_array",
                "call_int_and_float_and_string",
                "call_boolean_and_array",
                "test",
            ]
        );
    }
}

