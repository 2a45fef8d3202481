//! Runtime orchestration for bundle execution
//!
//! The Runtime owns one [`Vm`] configured from a JSON file and command-line
//! overrides, and runs code bundles on it.

use std::path::Path;
use std::sync::Arc;

use bytecode_system::{CodeBundle, CodeUnit};
use core_types::Value;
use interpreter::{EngineConfig, EngineStats, Vm};
use tracing::{debug, info};

use crate::cli::RunArgs;
use crate::error::{CliError, CliResult};

/// Persistent engine plus the reporting options of one invocation
pub struct Runtime {
    vm: Vm,
    show_stats: bool,
    show_disassembly: bool,
}

/// Read a whole file, tagging failures with the path
fn read(path: &Path) -> CliResult<String> {
    std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Load a bundle file and validate it
pub fn load_bundle(path: &Path) -> CliResult<Arc<CodeUnit>> {
    let text = read(path)?;
    let code = CodeBundle::load(&text)?;
    debug!(name = %code.name(), instructions = code.len(), "loaded bundle");
    Ok(code)
}

/// Engine configuration from an optional JSON file and flag overrides
///
/// Fields missing from the file keep their defaults.
pub fn engine_config(args: &RunArgs) -> CliResult<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => serde_json::from_str(&read(path)?).map_err(|source| CliError::Config {
            path: path.clone(),
            source,
        })?,
        None => EngineConfig::default(),
    };
    if args.no_specialize {
        config = config.with_specialization(false);
    }
    if args.no_tier2 {
        config = config.with_tier2(false);
    }
    if let Some(warmup) = args.warmup {
        config = config.with_warmup(warmup);
    }
    if let Some(threshold) = args.jump_threshold {
        config = config.with_jump_threshold(threshold);
    }
    if let Some(length) = args.max_trace_length {
        config = config.with_max_trace_length(length);
    }
    Ok(config)
}

impl Runtime {
    /// Create a runtime with the given engine configuration
    ///
    /// # Example
    /// ```
    /// use interpreter::EngineConfig;
    /// use vm_cli::Runtime;
    ///
    /// let runtime = Runtime::new(EngineConfig::default());
    /// assert!(runtime.vm().config().tier2);
    /// ```
    pub fn new(config: EngineConfig) -> Self {
        Self {
            vm: Vm::with_config(config),
            show_stats: false,
            show_disassembly: false,
        }
    }

    /// Build a runtime from `run` arguments
    pub fn from_args(args: &RunArgs) -> CliResult<Self> {
        let config = engine_config(args)?;
        info!(
            specialization = config.specialization,
            tier2 = config.tier2,
            warmup = config.adaptive_warmup,
            jump_threshold = config.jump_backward_threshold,
            "engine configured"
        );
        Ok(Self::new(config)
            .with_stats(args.stats)
            .with_disassembly(args.disassemble))
    }

    /// Print statistics after each run
    pub fn with_stats(mut self, enabled: bool) -> Self {
        self.show_stats = enabled;
        self
    }

    /// Print the quickened instructions after each run
    pub fn with_disassembly(mut self, enabled: bool) -> Self {
        self.show_disassembly = enabled;
        self
    }

    /// The underlying engine
    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    /// Mutable access to the underlying engine
    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }

    /// Counters accumulated so far
    pub fn stats(&self) -> EngineStats {
        self.vm.stats()
    }

    /// Load and run a bundle file
    ///
    /// # Errors
    /// Returns `CliError` if the file cannot be read, the bundle is malformed
    /// or execution fails.
    pub fn execute_file(&mut self, path: &Path) -> CliResult<Value> {
        let code = load_bundle(path)?;
        self.execute(&code)
    }

    /// Run a bundle given as JSON text
    pub fn execute_json(&mut self, text: &str) -> CliResult<Value> {
        let code = CodeBundle::load(text)?;
        self.execute(&code)
    }

    /// Run an already loaded code unit
    pub fn execute(&mut self, code: &Arc<CodeUnit>) -> CliResult<Value> {
        let result = self.vm.run(code);
        if self.show_disassembly {
            println!("{}", code.disassemble());
        }
        if self.show_stats {
            print!("{}", self.vm.stats());
        }
        Ok(result?)
    }
}

/// Disassembly of a bundle file, without running it
pub fn disassemble_file(path: &Path) -> CliResult<String> {
    Ok(load_bundle(path)?.disassemble())
}
