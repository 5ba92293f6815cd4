//! Runtime context: picks how each program runs and invokes it.
//!
//! A [`Runtime`] owns the pack allocator, the symbol directory and the release worker
//! for every program it finalizes. Independent runtimes share nothing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, info, info_span, warn};
use vbpf_config::RuntimeConfig;
use vbpf_jit::{HashRandom, JitBudget, PackAllocator, RandomSource};
use vbpf_symbol::{SymbolDirectory, SymbolEntry};
use vbpf_utils::Stopwatch;

use crate::backend::{JitBackend, JitContext, LinearX64Backend};
use crate::blind::blind;
use crate::interp::{HelperTable, Interpreter};
use crate::prog_aux::{KsymGuard, ProgramAux};
use crate::program::{Entry, Program};
use crate::release::ReleaseQueue;
use crate::{Result, RuntimeError};

pub struct Runtime {
    config: RuntimeConfig,
    symbols: Arc<SymbolDirectory>,
    allocator: Arc<PackAllocator>,
    budget: Arc<JitBudget>,
    rng: Arc<dyn RandomSource>,
    backend: Option<Arc<dyn JitBackend>>,
    interpreter: Interpreter,
    next_id: AtomicU32,
    release: ReleaseQueue,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|err| RuntimeError::Config(format!("{err:#}")))?;
        let release = ReleaseQueue::spawn(&config.release.thread_name)?;
        let runtime = Self {
            symbols: Arc::new(SymbolDirectory::new()),
            allocator: Arc::new(PackAllocator::new(&config.pack)),
            budget: Arc::new(JitBudget::new(config.jit.memory_limit)),
            rng: Arc::new(HashRandom::new()),
            backend: Some(Arc::new(LinearX64Backend)),
            interpreter: Interpreter::new(&config.interpreter, Arc::new(HelperTable::default())),
            next_id: AtomicU32::new(1),
            release,
            config,
        };
        info!(
            jit = runtime.config.jit.enabled,
            required = runtime.config.jit.required,
            blinding = runtime.config.jit.blinding,
            "runtime initialized"
        );
        Ok(runtime)
    }

    /// Replaces the JIT backend; `None` leaves only the interpreter.
    #[must_use]
    pub fn with_backend(mut self, backend: Option<Arc<dyn JitBackend>>) -> Self {
        self.backend = backend;
        self
    }

    #[must_use]
    pub fn with_random(mut self, rng: Arc<dyn RandomSource>) -> Self {
        self.rng = rng;
        self
    }

    #[must_use]
    pub fn with_helpers(mut self, helpers: HelperTable) -> Self {
        self.interpreter = Interpreter::new(&self.config.interpreter, Arc::new(helpers));
        self
    }

    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub const fn symbols(&self) -> &Arc<SymbolDirectory> {
        &self.symbols
    }

    pub const fn allocator(&self) -> &Arc<PackAllocator> {
        &self.allocator
    }

    pub const fn budget(&self) -> &Arc<JitBudget> {
        &self.budget
    }

    pub const fn interpreter(&self) -> &Interpreter {
        &self.interpreter
    }

    pub fn backend_name(&self) -> Option<&'static str> {
        self.backend.as_ref().map(|backend| backend.name())
    }

    /// Makes `prog` runnable: assigns its id and tag, tries the JIT when asked to, falls
    /// back to the interpreter, locks it and checks it against the program-holding maps
    /// it uses.
    pub fn finalize_runtime(&self, mut prog: Program) -> Result<Arc<Program>> {
        if prog.is_locked() {
            return Err(RuntimeError::InvalidState(
                "program is already finalized".to_string(),
            ));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match prog.aux_mut() {
            Some(aux) => aux.id = id,
            None => {
                let mut aux = ProgramAux::default();
                aux.id = id;
                prog.install_aux(Box::new(aux));
            }
        }
        prog.calc_tag();
        let _span = info_span!("prog", id, tag = %prog.tag_hex()).entered();

        let jit = &self.config.jit;
        if jit.enabled || jit.required || prog.flags().jit_requested {
            prog.request_jit();
            if jit.blinding {
                prog.request_blinding();
            }
            prog = self.jit_compile(prog);
        }
        if !prog.is_jited() {
            if jit.required {
                return Err(RuntimeError::Unsupported(format!(
                    "JIT required but program {id} produced no native code"
                )));
            }
            prog.select_interpreter()?;
        }

        prog.lock_readonly()?;
        Self::check_tail_call(&prog)?;
        if prog.is_jited() && jit.kallsyms {
            self.publish_symbol(&mut prog);
        }

        prog.attach_release(self.release.sender());
        info!(entry = ?prog.entry(), "program finalized");
        Ok(Arc::new(prog))
    }

    /// Compiles `prog`, blinding it first when requested. On any failure the original
    /// comes back without native code.
    fn jit_compile(&self, mut prog: Program) -> Program {
        let Some(backend) = &self.backend else {
            return prog;
        };
        let ctx = JitContext {
            allocator: &self.allocator,
            budget: &self.budget,
            rng: &*self.rng,
        };
        let blinded = match blind(&mut prog, &*self.rng) {
            Ok(blinded) => blinded,
            Err(err) => {
                warn!(%err, "blinding failed, interpreting");
                return prog;
            }
        };
        let Some(blinded) = blinded else {
            return backend.compile(prog, &ctx);
        };
        let compiled = backend.compile(blinded, &ctx);
        if compiled.is_jited() {
            return compiled;
        }
        warn!(backend = backend.name(), "JIT produced no code");
        compiled.release_other(&mut prog);
        prog
    }

    fn check_tail_call(prog: &Program) -> Result<()> {
        let Some(aux) = prog.aux() else {
            return Ok(());
        };
        for map in aux.used_maps() {
            if let Some(array) = map.as_prog_array() {
                array.check_compatible(prog)?;
            }
        }
        for desc in aux.poke_descriptors() {
            if let Some(array) = desc.map.as_prog_array() {
                array.check_compatible(prog)?;
            }
        }
        Ok(())
    }

    fn publish_symbol(&self, prog: &mut Program) {
        let Entry::Jited { image, .. } = prog.entry() else {
            return;
        };
        let (start, end) = image.range();
        let name = SymbolEntry::program_name(prog.tag(), prog.name());
        match self
            .symbols
            .register(SymbolEntry::program(name, start, end, prog.id()))
        {
            Ok(entry) => {
                debug!(symbol = %entry, "program symbol registered");
                if let Some(aux) = prog.aux_mut() {
                    aux.set_ksym(KsymGuard::new(Arc::clone(&self.symbols), start));
                }
            }
            Err(err) => warn!(%err, "program symbol not registered"),
        }
    }

    pub fn run(&self, prog: &Program, ctx: &mut [u8]) -> Result<u64> {
        self.run_with_cookie(prog, ctx, 0)
    }

    /// Invokes `prog` once and returns R0. `cookie` is what the attach-cookie helper
    /// reports to interpreted programs.
    pub fn run_with_cookie(&self, prog: &Program, ctx: &mut [u8], cookie: u64) -> Result<u64> {
        if !prog.is_locked() || matches!(prog.entry(), Entry::Unset) {
            prog.record_miss();
            return Err(RuntimeError::InvalidState(format!(
                "program {} has not been finalized",
                prog.id()
            )));
        }
        let _active = prog.enter();
        let watch = prog.stats_enabled().then(Stopwatch::start_new);
        let ret = match prog.entry() {
            Entry::Interpreter { stack_size } => {
                self.interpreter.execute(prog, *stack_size, ctx, cookie)
            }
            // SAFETY: the image was produced by a backend for the `JitFunc` convention and
            // stays mapped for as long as `prog` is borrowed.
            Entry::Jited { func, .. } => unsafe { func(ctx.as_mut_ptr(), prog.insns().as_ptr()) },
            Entry::Sentinel | Entry::Unset => 1,
        };
        if let Some(watch) = watch {
            prog.record_run(watch.elapsed_nanos());
        }
        Ok(ret)
    }

    /// Drops `prog` on the release worker instead of the calling thread.
    pub fn release(&self, prog: Arc<Program>) {
        self.release.release(prog);
    }

    /// Waits until every release queued so far has completed.
    pub fn flush(&self) {
        self.release.flush();
    }
}
