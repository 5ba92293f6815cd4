//! Operations behind the `vbpf` binary.

use std::path::Path;

use anyhow::{Context, bail};
use serde::Serialize;
use tracing::info;
use vbpf_config::RuntimeConfig;
use vbpf_insn::{Insn, decode_stream, disassemble};
use vbpf_runtime::{ProgType, Program, Runtime};

/// How `run` should finalize and invoke a program file.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub ctx: Vec<u8>,
    pub stack_depth: u32,
    pub jit: bool,
    pub jit_required: bool,
    pub harden: bool,
}

/// Reads a raw little-endian stream of 8-byte instructions.
pub fn load_insns(path: &Path) -> anyhow::Result<Vec<Insn>> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    decode_stream(&bytes).with_context(|| format!("failed to decode {}", path.display()))
}

/// Parses a context buffer given as hex digits, optionally `0x`-prefixed.
pub fn parse_hex(text: &str) -> anyhow::Result<Vec<u8>> {
    let digits = text.trim().trim_start_matches("0x").as_bytes();
    if let Some(idx) = digits.iter().position(|byte| !byte.is_ascii_hexdigit()) {
        bail!("invalid hex digit at offset {idx}");
    }
    if digits.len() % 2 != 0 {
        bail!("hex string has an odd number of digits");
    }
    Ok(digits
        .chunks_exact(2)
        .map(|pair| (hex_value(pair[0]) << 4) | hex_value(pair[1]))
        .collect())
}

#[inline]
const fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}

/// Finalizes the program in `path` through a fresh runtime, runs it once and returns R0
/// along with the final context contents.
pub fn run_file(path: &Path, options: &RunOptions) -> anyhow::Result<(u64, Vec<u8>)> {
    let insns = load_insns(path)?;

    let mut config = RuntimeConfig::default().merge_with_env();
    config.jit.enabled |= options.jit;
    config.jit.required |= options.jit_required;
    config.jit.blinding |= options.harden;
    let runtime = Runtime::new(config).context("failed to start runtime")?;

    let mut prog = Program::load(&insns, ProgType::Unspec).context("failed to load program")?;
    prog.set_stack_depth(options.stack_depth);
    if let Some(aux) = prog.aux_mut() {
        aux.name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    let prog = runtime
        .finalize_runtime(prog)
        .context("failed to finalize program")?;
    info!(id = prog.id(), jited = prog.is_jited(), "running program");

    let mut ctx = options.ctx.clone();
    let ret = runtime.run(&prog, &mut ctx)?;
    runtime.release(prog);
    runtime.flush();
    Ok((ret, ctx))
}

#[derive(Debug, Serialize)]
pub struct DumpInsn {
    pub index: usize,
    pub code: u8,
    pub dst: u8,
    pub src: u8,
    pub off: i16,
    pub imm: i32,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct Dump {
    pub tag: String,
    pub insns: Vec<DumpInsn>,
}

pub fn dump_insns(insns: &[Insn]) -> anyhow::Result<Dump> {
    let mut prog = Program::load(insns, ProgType::Unspec)?;
    prog.calc_tag();
    Ok(Dump {
        tag: prog.tag_hex(),
        insns: insns
            .iter()
            .enumerate()
            .map(|(index, insn)| DumpInsn {
                index,
                code: insn.code,
                dst: insn.dst(),
                src: insn.src(),
                off: insn.off,
                imm: insn.imm,
                text: insn.to_string(),
            })
            .collect(),
    })
}

/// Text or JSON listing of the program in `path`.
pub fn dump_file(path: &Path, json: bool) -> anyhow::Result<String> {
    let insns = load_insns(path)?;
    let dump = dump_insns(&insns)?;
    if json {
        return serde_json::to_string_pretty(&dump).context("failed to serialize dump");
    }
    let mut out = format!("tag {}\n", dump.tag);
    for line in disassemble(&insns) {
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}
