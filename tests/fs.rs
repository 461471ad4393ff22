mod common;

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs;
use std::rc::Rc;
use std::time::Duration;

use horizon_io::{
    DataChunk, Dir, DirectoryEntry, DirectoryEntryType, EventLoop, File, NetConfig, Removable, RemovalPhase,
    StatusCode, Timer,
};

use common::{pattern, Scratch};

fn small_buffers() -> NetConfig {
    NetConfig { file_read_buffer_size: 4096, file_read_buffers: 2, ..NetConfig::default() }
}

#[test]
fn directory_listing_reports_entry_types() -> anyhow::Result<()> {
    let scratch = Scratch::new("listing")?;
    for name in ["a", "b", "c"] {
        fs::create_dir(scratch.join(name))?;
    }
    fs::write(scratch.join("one.txt"), b"1")?;
    fs::write(scratch.join("two.txt"), b"2")?;
    std::os::unix::fs::symlink(scratch.join("one.txt"), scratch.join("link"))?;

    let lp = EventLoop::new()?;
    let dir = Dir::new(&lp);
    let entries = Rc::new(RefCell::new(Vec::<DirectoryEntry>::new()));
    let ends = Rc::new(Cell::new(0));
    let (e, n) = (Rc::clone(&entries), Rc::clone(&ends));
    dir.open(scratch.path(), move |dir: &Dir, result| {
        assert!(result.is_ok());
        dir.read(
            move |_: &Dir, entry| e.borrow_mut().push(entry),
            move |dir: &Dir, result| {
                assert!(result.is_ok());
                n.set(n.get() + 1);
                dir.close();
            },
        );
    });
    lp.run()?;

    assert_eq!(ends.get(), 1);
    let mut by_type: BTreeMap<String, DirectoryEntryType> = BTreeMap::new();
    for entry in entries.borrow().iter() {
        by_type.insert(entry.name.clone(), entry.entry_type);
    }
    assert_eq!(by_type.len(), 6);
    for name in ["a", "b", "c"] {
        assert_eq!(by_type[name], DirectoryEntryType::Dir);
    }
    assert_eq!(by_type["one.txt"], DirectoryEntryType::File);
    assert_eq!(by_type["two.txt"], DirectoryEntryType::File);
    assert_eq!(by_type["link"], DirectoryEntryType::Link);
    Ok(())
}

#[test]
fn opening_missing_or_wrong_paths_fails() -> anyhow::Result<()> {
    let scratch = Scratch::new("missing")?;
    fs::write(scratch.join("plain"), b"x")?;

    let lp = EventLoop::new()?;
    let outcomes = Rc::new(RefCell::new(Vec::new()));

    let o = Rc::clone(&outcomes);
    File::new(&lp).open(scratch.join("absent"), move |file: &File, result| {
        assert!(!file.is_open());
        o.borrow_mut().push(result.map_err(|e| e.code()));
    });
    let o = Rc::clone(&outcomes);
    Dir::new(&lp).open(scratch.join("plain"), move |_: &Dir, result| o.borrow_mut().push(result.map_err(|e| e.code())));
    lp.run()?;

    let mut got = outcomes.borrow().clone();
    got.sort_by_key(|r| format!("{:?}", r));
    let mut want = vec![Err(StatusCode::NoSuchFileOrDirectory), Err(StatusCode::NotADirectory)];
    want.sort_by_key(|r| format!("{:?}", r));
    assert_eq!(got, want);
    Ok(())
}

#[test]
fn streamed_read_delivers_whole_file_in_order() -> anyhow::Result<()> {
    let scratch = Scratch::new("stream")?;
    let content = pattern(100_000);
    fs::write(scratch.join("data.bin"), &content)?;

    let lp = EventLoop::with_config(small_buffers())?;
    let file = File::new(&lp);
    let assembled = Rc::new(RefCell::new(Vec::new()));
    let ends = Rc::new(RefCell::new(Vec::new()));
    let (a, e) = (Rc::clone(&assembled), Rc::clone(&ends));
    file.open(scratch.join("data.bin"), move |file: &File, result| {
        assert!(result.is_ok());
        file.read(
            move |file: &File, chunk: DataChunk| {
                assert!(file.buffers_in_use() <= 2);
                assert_eq!(chunk.offset(), a.borrow().len() as u64);
                a.borrow_mut().extend_from_slice(&chunk);
            },
            move |file: &File, result| {
                e.borrow_mut().push(result.map_err(|e| e.code()));
                file.close();
            },
        );
    });
    lp.run()?;

    assert_eq!(*ends.borrow(), vec![Ok(())]);
    assert_eq!(*assembled.borrow(), content);
    Ok(())
}

#[test]
fn held_chunks_throttle_the_read() -> anyhow::Result<()> {
    let scratch = Scratch::new("throttle")?;
    let content = pattern(40_000);
    fs::write(scratch.join("data.bin"), &content)?;

    let lp = EventLoop::with_config(small_buffers())?;
    let file = File::new(&lp);
    let held = Rc::new(RefCell::new(Vec::<DataChunk>::new()));
    let assembled = Rc::new(RefCell::new(Vec::new()));
    let peak = Rc::new(Cell::new(0));
    let done = Rc::new(Cell::new(false));
    let release = Timer::new(&lp);

    let (h, a, p, d) = (Rc::clone(&held), Rc::clone(&assembled), Rc::clone(&peak), Rc::clone(&done));
    file.open(scratch.join("data.bin"), move |file: &File, result| {
        assert!(result.is_ok());
        file.read(
            move |file: &File, chunk: DataChunk| {
                a.borrow_mut().extend_from_slice(&chunk);
                h.borrow_mut().push(chunk);
                p.set(p.get().max(file.buffers_in_use()));
                if file.buffers_in_use() == 2 && !release.is_active() {
                    let h = Rc::clone(&h);
                    release.start(Duration::from_millis(10), move |_| h.borrow_mut().clear());
                }
            },
            move |file: &File, result| {
                assert!(result.is_ok());
                d.set(true);
                file.schedule_removal();
            },
        );
    });
    lp.run()?;

    assert!(done.get());
    assert_eq!(peak.get(), 2);
    assert_eq!(*assembled.borrow(), content);
    Ok(())
}

#[test]
fn block_read_and_stat() -> anyhow::Result<()> {
    let scratch = Scratch::new("block")?;
    let content = pattern(10_000);
    fs::write(scratch.join("data.bin"), &content)?;

    let lp = EventLoop::new()?;
    let file = File::new(&lp);
    let blocks = Rc::new(RefCell::new(Vec::new()));
    let size = Rc::new(Cell::new(None));
    let (b, s) = (Rc::clone(&blocks), Rc::clone(&size));
    file.open(scratch.join("data.bin"), move |file: &File, result| {
        assert!(result.is_ok());
        let s = Rc::clone(&s);
        file.stat(move |_: &File, meta| s.set(meta.ok().map(|m| m.len())));
        let b1 = Rc::clone(&b);
        file.read_block(1000, 500, move |_: &File, chunk| {
            let chunk = chunk.map_err(|e| e.code());
            b1.borrow_mut().push(chunk.map(|c| (c.offset(), c.to_vec())));
        });
        let b2 = Rc::clone(&b);
        file.read_block(9_900, 500, move |file: &File, chunk| {
            let chunk = chunk.map_err(|e| e.code());
            b2.borrow_mut().push(chunk.map(|c| (c.offset(), c.to_vec())));
            file.close();
        });
    });
    lp.run()?;

    assert_eq!(size.get(), Some(10_000));
    let mut blocks = blocks.borrow().clone();
    blocks.sort_by_key(|r| r.as_ref().map(|(offset, _)| *offset).unwrap_or(0));
    assert_eq!(
        blocks,
        vec![Ok((1000, content[1000..1500].to_vec())), Ok((9_900, content[9_900..].to_vec()))]
    );
    Ok(())
}

#[test]
fn operations_on_closed_file_fail() -> anyhow::Result<()> {
    let lp = EventLoop::new()?;
    let file = File::new(&lp);
    let outcomes = Rc::new(RefCell::new(Vec::new()));
    let o = Rc::clone(&outcomes);
    file.read(|_: &File, _: DataChunk| {}, move |_: &File, result| o.borrow_mut().push(result.map_err(|e| e.code())));
    let o = Rc::clone(&outcomes);
    file.read_block(0, 10, move |_: &File, result| o.borrow_mut().push(result.map(|_| ()).map_err(|e| e.code())));
    lp.run()?;
    assert_eq!(*outcomes.borrow(), vec![Err(StatusCode::FileNotOpen), Err(StatusCode::FileNotOpen)]);
    Ok(())
}

#[test]
fn removal_completes_once_buffers_return() -> anyhow::Result<()> {
    let scratch = Scratch::new("removal")?;
    fs::write(scratch.join("data.bin"), pattern(20_000))?;

    let lp = EventLoop::with_config(small_buffers())?;
    let file = File::new(&lp);
    let kept = Rc::new(RefCell::new(None::<DataChunk>));
    let removed = Rc::new(Cell::new(false));
    let r = Rc::clone(&removed);
    file.set_on_schedule_removal(move || r.set(true));

    let k = Rc::clone(&kept);
    let ended = Rc::new(RefCell::new(None));
    let e = Rc::clone(&ended);
    let release = Timer::new(&lp);
    file.open(scratch.join("data.bin"), move |file: &File, result| {
        assert!(result.is_ok());
        let k2 = Rc::clone(&k);
        file.read(
            move |file: &File, chunk: DataChunk| {
                if k2.borrow().is_some() {
                    return;
                }
                *k2.borrow_mut() = Some(chunk);
                file.schedule_removal();
                assert_eq!(file.removal_phase(), RemovalPhase::RemovalScheduled);
                let k3 = Rc::clone(&k2);
                release.start(Duration::from_millis(20), move |_| {
                    k3.borrow_mut().take();
                });
            },
            move |_: &File, result| *e.borrow_mut() = Some(result.map_err(|e| e.code())),
        );
    });
    lp.run()?;

    assert_eq!(*ended.borrow(), Some(Err(StatusCode::OperationCanceled)));
    assert!(kept.borrow().is_none());
    assert!(removed.get());
    assert_eq!(file.removal_phase(), RemovalPhase::Removed);
    Ok(())
}
