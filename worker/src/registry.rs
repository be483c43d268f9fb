//! Named entry points, eval commands and modules
//!
//! A worker cannot compile code it receives, so everything a parent may ask
//! for is bound by name when the worker binary is built. `eval` frames call
//! commands from this registry and `run` frames look up entry points in it.
//!
//! Two commands are always present:
//!
//! - `require <module>...` runs each module's initialiser once per process
//! - `set <name> <value>` stores a variable in the shared [`Scope`]

use anyhow::{anyhow, bail};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use tracing::debug;

/// Name of the built-in module loader
pub const REQUIRE: &str = "require";
/// Name of the built-in variable setter
pub const SET: &str = "set";

/// One accumulated argument
#[derive(Debug)]
pub enum Arg {
    /// A descriptor received from the parent
    Fd(OwnedFd),
    /// A string received from the parent
    Bytes(Vec<u8>),
}

impl Arg {
    /// Raw bytes of a string argument
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Arg::Bytes(bytes) => Some(bytes),
            Arg::Fd(_) => None,
        }
    }

    /// A string argument as UTF-8
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// A descriptor argument
    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        match self {
            Arg::Fd(fd) => Some(fd.as_fd()),
            Arg::Bytes(_) => None,
        }
    }

    /// Take ownership of a descriptor argument
    pub fn into_fd(self) -> Option<OwnedFd> {
        match self {
            Arg::Fd(fd) => Some(fd),
            Arg::Bytes(_) => None,
        }
    }
}

/// State shared by eval commands and the final entry point
#[derive(Debug, Default)]
pub struct Scope {
    vars: HashMap<String, Vec<u8>>,
    loaded: BTreeSet<String>,
}

impl Scope {
    /// Look up a variable
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.vars.get(name).map(Vec::as_slice)
    }

    /// Store a variable, replacing any previous value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.vars.insert(name.into(), value.into());
    }

    /// Whether a module has been initialised
    pub fn is_loaded(&self, module: &str) -> bool {
        self.loaded.contains(module)
    }

    /// Names of initialised modules, sorted
    pub fn loaded(&self) -> impl Iterator<Item = &str> {
        self.loaded.iter().map(String::as_str)
    }
}

/// Everything an entry point receives
#[derive(Debug)]
pub struct Handoff {
    /// The control socket; from now on it carries user data only
    pub control: UnixStream,
    /// Accumulated descriptors and strings, in the order they arrived
    pub args: Vec<Arg>,
    /// Variables and modules set up by earlier `eval` frames
    pub scope: Scope,
    /// Pid of the process that created the worker
    pub owner: u32,
}

/// Function a worker can hand off to
pub type EntryPoint = Box<dyn Fn(Handoff) -> anyhow::Result<()> + Send + Sync>;
/// Command callable through `eval`: scope, accumulator, call arguments
pub type EvalCommand = Box<dyn Fn(&mut Scope, &[Arg], &[Vec<u8>]) -> anyhow::Result<()> + Send + Sync>;
/// Module initialiser run by `require`
pub type ModuleInit = Box<dyn Fn(&mut Scope) -> anyhow::Result<()> + Send + Sync>;

/// Name-to-function bindings available to the serve loop
#[derive(Default)]
pub struct Registry {
    entries: HashMap<String, EntryPoint>,
    commands: HashMap<String, EvalCommand>,
    modules: HashMap<String, ModuleInit>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<_> = self.entries.keys().collect();
        entries.sort();
        let mut commands: Vec<_> = self.commands.keys().collect();
        commands.sort();
        let mut modules: Vec<_> = self.modules.keys().collect();
        modules.sort();
        f.debug_struct("Registry")
            .field("entries", &entries)
            .field("commands", &commands)
            .field("modules", &modules)
            .finish()
    }
}

impl Registry {
    /// Create a registry holding only the built-in commands
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an entry point
    #[must_use]
    pub fn with_entry_point<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Handoff) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.entries.insert(name.to_string(), Box::new(f));
        self
    }

    /// Bind an eval command.
    ///
    /// The built-in names `require` and `set` cannot be overridden.
    #[must_use]
    pub fn with_command<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&mut Scope, &[Arg], &[Vec<u8>]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.commands.insert(name.to_string(), Box::new(f));
        self
    }

    /// Bind a module initialiser
    #[must_use]
    pub fn with_module<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&mut Scope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.modules.insert(name.to_string(), Box::new(f));
        self
    }

    /// Look up an entry point
    pub fn entry_point(&self, name: &str) -> Option<&EntryPoint> {
        self.entries.get(name)
    }

    /// Run an eval command
    ///
    /// `accumulator` is visible to the command but never modified.
    pub fn eval(
        &self,
        scope: &mut Scope,
        command: &str,
        accumulator: &[Arg],
        args: &[Vec<u8>],
    ) -> anyhow::Result<()> {
        match command {
            REQUIRE => self.require(scope, args),
            SET => match args {
                [name, value] => {
                    let name = std::str::from_utf8(name)
                        .map_err(|_| anyhow!("variable name is not valid UTF-8"))?;
                    scope.set(name, value.clone());
                    Ok(())
                }
                _ => bail!("set takes a name and a value, got {} arguments", args.len()),
            },
            other => match self.commands.get(other) {
                Some(cmd) => cmd(scope, accumulator, args),
                None => bail!("unknown eval command '{other}'"),
            },
        }
    }

    fn require(&self, scope: &mut Scope, modules: &[Vec<u8>]) -> anyhow::Result<()> {
        for module in modules {
            let name = std::str::from_utf8(module)
                .map_err(|_| anyhow!("module name is not valid UTF-8"))?;
            if scope.is_loaded(name) {
                continue;
            }
            let init = self
                .modules
                .get(name)
                .ok_or_else(|| anyhow!("unknown module '{name}'"))?;
            init(scope)?;
            scope.loaded.insert(name.to_string());
            debug!("Loaded module {}", name);
        }
        Ok(())
    }
}
