//! End-to-end tests driving [`TraceEngine`] through its hook surface, the
//! way an interposed allocator would.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use memtrace::{Filter, FnProvider, SourceFrame, Task, TraceEngine};

/// A stack script the test can rewrite between allocation events.
#[derive(Clone, Default)]
struct Script {
    frames: Arc<Mutex<Vec<SourceFrame>>>,
}

impl Script {
    fn set(&self, filename: &str, lineno: u32) {
        self.set_frames(vec![SourceFrame {
            filename: String::from(filename),
            lineno,
        }]);
    }

    fn set_frames(&self, frames: Vec<SourceFrame>) {
        *self.frames.lock().unwrap() = frames;
    }

    fn engine(&self) -> TraceEngine {
        let frames = Arc::clone(&self.frames);
        let provider = FnProvider::new(move |limit| {
            frames.lock().unwrap().iter().take(limit).cloned().collect()
        });
        let engine = TraceEngine::new(Box::new(provider)).unwrap();
        engine.enable();
        engine
    }
}

#[test]
fn traced_memory_matches_the_sum_of_live_traces() {
    let script = Script::default();
    script.set("app.py", 1);
    let engine = script.engine();

    engine.on_alloc(0x1000, 100);
    engine.on_alloc(0x2000, 250);
    script.set("lib.py", 7);
    engine.on_alloc(0x3000, 40);
    engine.on_free(0x2000);
    engine.on_realloc(0x1000, 0x4000, 175);

    let traces = engine.traces().unwrap();
    let trace_total: usize = traces.iter().map(|trace| trace.size).sum();
    assert_eq!(trace_total, engine.traced_memory().0);
    assert_eq!(trace_total, 215);

    let stat_total: usize = engine.stats().unwrap().iter().map(|stat| stat.size).sum();
    assert_eq!(stat_total, trace_total);
}

#[test]
fn identical_stacks_share_one_interned_traceback() {
    let script = Script::default();
    script.set("app.py", 42);
    let engine = script.engine();

    engine.on_alloc(0x1000, 10);
    engine.on_alloc(0x2000, 20);
    script.set("app.py", 43);
    engine.on_alloc(0x3000, 30);

    let first = engine.trace(0x1000).unwrap();
    let second = engine.trace(0x2000).unwrap();
    let third = engine.trace(0x3000).unwrap();

    assert!(Arc::ptr_eq(&first.traceback, &second.traceback));
    assert!(!Arc::ptr_eq(&first.traceback, &third.traceback));

    // Filenames are interned independently of line numbers.
    assert!(Arc::ptr_eq(
        &first.traceback.top_frame().filename,
        &third.traceback.top_frame().filename,
    ));
}

#[test]
fn peak_tracks_the_high_water_mark() {
    let script = Script::default();
    script.set("app.py", 1);
    let engine = script.engine();

    engine.on_alloc(0x1000, 300);
    engine.on_alloc(0x2000, 700);
    engine.on_free(0x1000);
    engine.on_free(0x2000);
    engine.on_alloc(0x3000, 100);

    assert_eq!(engine.traced_memory(), (100, 1000));
}

#[test]
fn filters_decide_what_gets_recorded() {
    let script = Script::default();
    let engine = script.engine();
    engine.add_filter(Filter::include("x.py").unwrap());

    script.set("y.py", 10);
    engine.on_alloc(0x1000, 100);
    assert_eq!(engine.traced_memory().0, 0);

    script.set("x.py", 10);
    engine.on_alloc(0x2000, 100);
    assert_eq!(engine.traced_memory().0, 100);

    engine.add_filter(Filter::exclude("x.py").unwrap().with_lineno(10));

    engine.on_alloc(0x3000, 100);
    assert_eq!(engine.traced_memory().0, 100);

    script.set("x.py", 11);
    engine.on_alloc(0x4000, 100);
    assert_eq!(engine.traced_memory().0, 200);
}

#[test]
fn wildcard_patterns_match_compiled_filenames() {
    let script = Script::default();
    let engine = script.engine();
    engine.add_filter(Filter::include("*/foo.py").unwrap());

    script.set("/a/b/foo.pyc", 5);
    engine.on_alloc(0x1000, 64);

    script.set("/a/b/bar.py", 5);
    engine.on_alloc(0x2000, 64);

    let traces = engine.traces().unwrap();
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].address, 0x1000);
    assert_eq!(&*traces[0].traceback.top_frame().filename, "/a/b/foo.pyc");
}

#[test]
fn wildcard_filters_never_match_the_sentinel_stack() {
    let script = Script::default();
    script.set("app.py", 1);
    let engine = script.engine();
    engine.set_frame_limit(0).unwrap();

    // With no captured frames an include filter drops the allocation even
    // when its pattern matches everything.
    engine.add_filter(Filter::include("*").unwrap());
    engine.on_alloc(0x1000, 100);
    assert_eq!(engine.traced_memory().0, 0);
    assert!(engine.traces().unwrap().is_empty());

    // And a match-everything exclude filter lets it through.
    engine.clear_filters();
    engine.add_filter(Filter::exclude("*").unwrap());
    engine.on_alloc(0x2000, 100);
    assert_eq!(engine.traced_memory().0, 100);
    assert_eq!(
        &*engine.trace(0x2000).unwrap().traceback.top_frame().filename,
        "<unknown>"
    );
}

#[test]
fn frees_of_filtered_allocations_are_ignored() {
    let script = Script::default();
    let engine = script.engine();
    engine.add_filter(Filter::include("x.py").unwrap());

    script.set("y.py", 1);
    engine.on_alloc(0x1000, 100);

    script.set("x.py", 1);
    engine.on_alloc(0x2000, 100);

    // The first allocation was never tracked; its free must not disturb
    // the counters.
    engine.on_free(0x1000);
    assert_eq!(engine.traced_memory().0, 100);

    engine.on_free(0x2000);
    assert_eq!(engine.traced_memory().0, 0);
}

#[test]
fn memory_threshold_task_fires_when_traced_memory_leaves_the_band() {
    let script = Script::default();
    script.set("app.py", 1);
    let engine = script.engine();

    for i in 0..10_usize {
        engine.on_alloc(0x1000 + i * 0x10, 500);
    }
    assert_eq!(engine.traced_memory().0, 5000);

    let fired = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&fired);
    engine
        .schedule_task(
            Task::new(move || {
                seen.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .with_memory_threshold(1000),
        )
        .unwrap();

    // 5500 stays inside [4000, 6000].
    engine.on_alloc(0x5000, 500);
    assert_eq!(fired.load(Ordering::Relaxed), 0);

    // 6000 reaches the upper edge.
    engine.on_alloc(0x6000, 500);
    assert_eq!(fired.load(Ordering::Relaxed), 1);

    // The band recentered around 6000; dropping to 5000 reaches its lower
    // edge.
    engine.on_free(0x5000);
    assert_eq!(fired.load(Ordering::Relaxed), 1);
    engine.on_free(0x6000);
    assert_eq!(fired.load(Ordering::Relaxed), 2);
}

#[test]
fn deep_stacks_are_captured_up_to_the_frame_limit() {
    let script = Script::default();
    script.set_frames(vec![
        SourceFrame {
            filename: String::from("inner.py"),
            lineno: 1,
        },
        SourceFrame {
            filename: String::from("mid.py"),
            lineno: 2,
        },
        SourceFrame {
            filename: String::from("outer.py"),
            lineno: 3,
        },
    ]);
    let engine = script.engine();

    // Default limit keeps only the innermost frame.
    engine.on_alloc(0x1000, 10);
    assert_eq!(engine.trace(0x1000).unwrap().traceback.frames().len(), 1);

    engine.set_frame_limit(3).unwrap();
    engine.on_alloc(0x2000, 10);

    let traceback = engine.trace(0x2000).unwrap().traceback;
    let filenames: Vec<&str> = traceback
        .frames()
        .iter()
        .map(|frame| &*frame.filename)
        .collect();
    assert_eq!(filenames, ["inner.py", "mid.py", "outer.py"]);

    // Statistics attribute the allocation to the innermost frame.
    let stats = engine.stats().unwrap();
    assert!(
        stats
            .iter()
            .all(|stat| &*stat.filename == "inner.py")
    );
}

#[test]
fn stats_aggregate_per_source_line() {
    let script = Script::default();
    let engine = script.engine();

    script.set("a.py", 1);
    engine.on_alloc(0x1000, 100);
    engine.on_alloc(0x2000, 50);
    script.set("a.py", 2);
    engine.on_alloc(0x3000, 30);
    script.set("b.py", 1);
    engine.on_alloc(0x4000, 5);

    let mut stats = engine.stats().unwrap();
    stats.sort_by(|a, b| (&*a.filename, a.lineno).cmp(&(&*b.filename, b.lineno)));

    assert_eq!(stats.len(), 3);
    assert_eq!((&*stats[0].filename, stats[0].lineno), ("a.py", 1));
    assert_eq!((stats[0].size, stats[0].count), (150, 2));
    assert_eq!((&*stats[1].filename, stats[1].lineno), ("a.py", 2));
    assert_eq!((stats[1].size, stats[1].count), (30, 1));
    assert_eq!((&*stats[2].filename, stats[2].lineno), ("b.py", 1));
    assert_eq!((stats[2].size, stats[2].count), (5, 1));

    // Freeing the last allocation from a line removes its entry entirely.
    engine.on_free(0x3000);
    let stats = engine.stats().unwrap();
    assert!(
        stats
            .iter()
            .all(|stat| (&*stat.filename, stat.lineno) != ("a.py", 2))
    );
}

#[test]
fn disable_then_enable_starts_from_a_clean_slate() {
    let script = Script::default();
    script.set("app.py", 1);
    let engine = script.engine();

    engine.on_alloc(0x1000, 100);
    engine.disable();

    assert_eq!(engine.traced_memory(), (0, 0));
    assert!(engine.tasks().is_empty());

    engine.enable();
    engine.on_alloc(0x2000, 42);
    assert_eq!(engine.traced_memory(), (42, 42));
}
