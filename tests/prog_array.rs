use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use vbpf::insn::opcode::ADD;
use vbpf::insn::{R0, alu64_imm, call_helper, exit};
use vbpf::runtime::interp::helpers::HELPER_GET_ATTACH_COOKIE;
use vbpf::{ProgArray, ProgArrayCell, ProgType, Program, Runtime, RuntimeConfig, RuntimeError};

/// A program returning `value` plus its attach cookie.
fn program(rt: &Runtime, value: i32) -> Arc<Program> {
    let insns = [
        call_helper(HELPER_GET_ATTACH_COOKIE),
        alu64_imm(ADD, R0, value),
        exit(),
    ];
    rt.finalize_runtime(Program::load(&insns, ProgType::CgroupSkb).unwrap())
        .unwrap()
}

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::default()).unwrap()
}

#[test]
fn test_attach_detach_preserves_order() {
    let rt = runtime();
    let cell = ProgArrayCell::new();
    let progs: Vec<_> = (1..=4).map(|value| program(&rt, value * 10)).collect();
    for (cookie, prog) in progs.iter().enumerate() {
        cell.attach(Arc::clone(prog), cookie as u64).unwrap();
    }
    assert_eq!(cell.run_all(&rt, &mut []).unwrap(), vec![10, 21, 32, 43]);

    let before = cell.load();
    cell.detach(&progs[1]).unwrap();
    assert_eq!(cell.run_all(&rt, &mut []).unwrap(), vec![10, 32, 43]);
    // Readers holding the previous generation still see it whole.
    assert_eq!(before.length(), 4);

    cell.attach(Arc::clone(&progs[1]), 9).unwrap();
    assert_eq!(cell.run_all(&rt, &mut []).unwrap(), vec![10, 32, 43, 29]);
}

#[test]
fn test_membership_errors() {
    let rt = runtime();
    let cell = ProgArrayCell::new();
    let first = program(&rt, 1);
    let stranger = program(&rt, 2);
    cell.attach(Arc::clone(&first), 0).unwrap();

    assert!(matches!(
        cell.attach(Arc::clone(&first), 5),
        Err(RuntimeError::AlreadyExists(id)) if id == first.id()
    ));
    assert!(matches!(
        cell.detach(&stranger),
        Err(RuntimeError::NotFound(_))
    ));
    assert_eq!(cell.load().length(), 1);
}

#[test]
fn test_deleted_slots_run_as_sentinels_and_vanish_on_copy() {
    let rt = runtime();
    let progs: Vec<_> = (1..=3).map(|value| program(&rt, value)).collect();
    let array = progs.iter().fold(ProgArray::empty(), |array, prog| {
        ProgArray::copy_with(Some(&array), None, Some((Arc::clone(prog), 0))).unwrap()
    });

    array.mark_deleted(&progs[0]).unwrap();
    assert_eq!(array.length(), 2);
    assert_eq!(array.items().len(), 3);
    assert_eq!(array.run_all(&rt, &mut []).unwrap(), vec![1, 2, 3]);
    assert_eq!(array.ids(1), (vec![progs[1].id()], true));
    assert_eq!(array.ids(8), (vec![progs[1].id(), progs[2].id()], false));

    let compact = ProgArray::copy_with(Some(&array), None, None).unwrap();
    assert_eq!(compact.items().len(), 2);
    assert!(matches!(
        ProgArray::copy_with(Some(&compact), Some(&progs[0]), None),
        Err(RuntimeError::NotFound(_))
    ));
}

#[test]
fn test_readers_see_whole_generations() {
    let rt = runtime();
    let cell = ProgArrayCell::new();
    let progs: Vec<_> = (0..8).map(|value| program(&rt, value)).collect();
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    let generation = cell.load();
                    let (ids, _) = generation.ids(usize::MAX);
                    // Attach order is id order, so every generation is sorted.
                    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
                }
            });
        }
        for _ in 0..50 {
            for prog in &progs {
                cell.attach(Arc::clone(prog), 0).unwrap();
            }
            for prog in &progs {
                cell.detach(prog).unwrap();
            }
        }
        done.store(true, Ordering::Release);
    });
    assert!(cell.load().is_empty());
}
