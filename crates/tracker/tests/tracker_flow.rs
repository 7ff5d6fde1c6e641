#![forbid(unsafe_code)]

use config::Config;
use tracker::Tracker;
use tracker::event::{Event, Payload, RemapFlags, SYSCALL_FAILED, ThreadHandle};
use tracker::feed::Delta;
use tracker::filter::SubjectFilter;
use tracker::route::EventRouter;

const PAGE: u64 = 4096;

fn config() -> Config {
    let mut config = Config::default();
    config.system.pagesize = Some(PAGE);
    config
}

fn handle(pid: i32, tid: u32) -> ThreadHandle {
    ThreadHandle::from_raw(((pid as u64) << 32) | tid as u64)
}

fn event(pid: i32, tid: u32, payload: Payload) -> Event {
    Event {
        handle: handle(pid, tid),
        timestamp: 0,
        payload,
    }
}

/// Router in global mode: every pid routes live, no fork bookkeeping.
fn global_router(tracker: &Tracker) -> EventRouter {
    let mut filter = SubjectFilter::new(0, 4096);
    filter.enable_global_mode();
    EventRouter::new(filter, tracker.clone())
}

fn mmap(router: &mut EventRouter, pid: i32, addr: u64, size: u64) {
    router.handle(event(
        pid,
        1,
        Payload::MmapEnter {
            requested_addr: 0,
            size,
            comm: "test".into(),
        },
    ));
    router.handle(event(pid, 1, Payload::MmapExit { actual_addr: addr }));
}

fn mremap(router: &mut EventRouter, pid: i32, old: (u64, u64), new_size: u64, flags: RemapFlags, ret: u64) {
    router.handle(event(
        pid,
        1,
        Payload::MremapEnter {
            old_addr: old.0,
            old_size: old.1,
            new_addr: 0,
            new_size,
            flags,
            comm: "test".into(),
        },
    ));
    router.handle(event(pid, 1, Payload::MremapExit { new_addr: ret }));
}

#[test]
fn brk_round_trip() {
    let tracker = Tracker::new(&config());
    let (_, live) = tracker.subscribe();

    // first observation only sets the watermark
    tracker.handle_brk(7, 7, 0x1000, "a");
    assert!(tracker.catchup_log().is_empty());
    assert!(live.try_recv().is_err());

    tracker.handle_brk(7, 7, 0x3000, "a");
    let Delta::Add { id, start, end, .. } = live.try_recv().unwrap() else {
        panic!("expected an add");
    };
    assert_eq!((start, end), (0x1000, 0x3000));

    // shrink: the heap region is truncated at the new break
    tracker.handle_brk(7, 7, 0x2000, "a");
    let Delta::Remove { id: removed, .. } = live.try_recv().unwrap() else {
        panic!("expected a remove");
    };
    assert_eq!(removed, id);
    let Delta::Add { id: rest, start, end, .. } = live.try_recv().unwrap() else {
        panic!("expected an add");
    };
    assert_ne!(rest, id);
    assert_eq!((start, end), (0x1000, 0x2000));

    // equal break is a no-op
    tracker.handle_brk(7, 7, 0x2000, "a");
    assert!(live.try_recv().is_err());

    let regions = tracker.regions(7);
    assert_eq!(regions.len(), 1);
    assert_eq!((regions[0].start, regions[0].end), (0x1000, 0x2000));
}

#[test]
fn brk_watermarks_are_per_thread() {
    let tracker = Tracker::new(&config());
    tracker.handle_brk(7, 1, 0x1000, "a");
    // a different thread of the same process starts its own baseline
    tracker.handle_brk(7, 2, 0x5000, "a");
    assert!(tracker.catchup_log().is_empty());

    tracker.handle_brk(7, 1, 0x2000, "a");
    let regions = tracker.regions(7);
    assert_eq!(regions.len(), 1);
    assert_eq!((regions[0].start, regions[0].end), (0x1000, 0x2000));
}

#[test]
fn mmap_pairs_resolve_to_the_returned_address() {
    let tracker = Tracker::new(&config());
    let mut router = global_router(&tracker);

    router.handle(event(
        3,
        1,
        Payload::MmapEnter {
            requested_addr: 0,
            size: 2 * PAGE,
            comm: "cat".into(),
        },
    ));
    assert!(tracker.regions(3).is_empty());

    router.handle(event(3, 1, Payload::MmapExit { actual_addr: 0x7000_0000 }));
    let regions = tracker.regions(3);
    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].start, 0x7000_0000);
    assert_eq!(regions[0].size, 2 * PAGE);
    assert_eq!(regions[0].tag, "cat");
}

#[test]
fn failed_mmap_consumes_the_pending_enter() {
    let tracker = Tracker::new(&config());
    let mut router = global_router(&tracker);

    router.handle(event(
        3,
        1,
        Payload::MmapEnter {
            requested_addr: 0,
            size: PAGE,
            comm: "cat".into(),
        },
    ));
    router.handle(event(3, 1, Payload::MmapExit { actual_addr: SYSCALL_FAILED }));
    assert!(tracker.regions(3).is_empty());

    // the entry was consumed: a stray second exit changes nothing
    router.handle(event(3, 1, Payload::MmapExit { actual_addr: 0x1000 }));
    assert!(tracker.regions(3).is_empty());
}

#[test]
fn mremap_moves_the_region() {
    let tracker = Tracker::new(&config());
    let mut router = global_router(&tracker);
    mmap(&mut router, 5, 0x10000, PAGE);

    mremap(
        &mut router,
        5,
        (0x10000, PAGE),
        2 * PAGE,
        RemapFlags::MAYMOVE,
        0x40000,
    );

    let regions = tracker.regions(5);
    assert_eq!(regions.len(), 1);
    assert_eq!((regions[0].start, regions[0].end), (0x40000, 0x40000 + 2 * PAGE));
}

#[test]
fn mremap_dontunmap_keeps_the_old_region() {
    let tracker = Tracker::new(&config());
    let mut router = global_router(&tracker);
    mmap(&mut router, 5, 0x10000, PAGE);

    mremap(
        &mut router,
        5,
        (0x10000, PAGE),
        PAGE,
        RemapFlags::MAYMOVE | RemapFlags::DONTUNMAP,
        0x40000,
    );

    let regions = tracker.regions(5);
    assert_eq!(regions.len(), 2);
    assert_eq!(regions[0].start, 0x10000);
    assert_eq!(regions[1].start, 0x40000);
}

#[test]
fn mremap_in_place_grow() {
    let tracker = Tracker::new(&config());
    let mut router = global_router(&tracker);
    mmap(&mut router, 5, 0x10000, PAGE);

    // no flags: old range is unmapped, new lands at the same address
    mremap(
        &mut router,
        5,
        (0x10000, PAGE),
        4 * PAGE,
        RemapFlags::empty(),
        0x10000,
    );

    let regions = tracker.regions(5);
    assert_eq!(regions.len(), 1);
    assert_eq!((regions[0].start, regions[0].end), (0x10000, 0x10000 + 4 * PAGE));
}

#[test]
fn failed_mremap_changes_nothing() {
    let tracker = Tracker::new(&config());
    let mut router = global_router(&tracker);
    mmap(&mut router, 5, 0x10000, PAGE);

    mremap(
        &mut router,
        5,
        (0x10000, PAGE),
        2 * PAGE,
        RemapFlags::MAYMOVE,
        SYSCALL_FAILED,
    );

    let regions = tracker.regions(5);
    assert_eq!(regions.len(), 1);
    assert_eq!((regions[0].start, regions[0].end), (0x10000, 0x10000 + PAGE));
}

#[test]
fn munmap_is_immediate() {
    let tracker = Tracker::new(&config());
    let mut router = global_router(&tracker);
    mmap(&mut router, 5, 0x10000, 3 * PAGE);

    router.handle(event(
        5,
        1,
        Payload::Munmap {
            start_addr: 0x10000 + PAGE,
            size: PAGE,
            comm: "test".into(),
        },
    ));

    let regions = tracker.regions(5);
    assert_eq!(regions.len(), 2);
}

#[test]
fn catchup_is_complete_and_ordered() {
    let tracker = Tracker::new(&config());
    tracker.add_allocation(1, 0, PAGE, "a");
    tracker.add_allocation(1, 2 * PAGE, PAGE, "a");
    tracker.remove_allocation(1, 0, PAGE);

    let (catchup, live) = tracker.subscribe();
    assert_eq!(catchup.len(), 3);
    assert_eq!(catchup, tracker.catchup_log());
    let t_values: Vec<u64> = catchup
        .iter()
        .map(|delta| match delta {
            Delta::Add { t, .. } | Delta::Remove { t, .. } => *t,
        })
        .collect();
    assert!(t_values.windows(2).all(|w| w[0] <= w[1]));

    // live deltas only start after the catch-up batch
    assert!(live.try_recv().is_err());
    tracker.add_allocation(1, 4 * PAGE, PAGE, "a");
    assert!(matches!(live.try_recv().unwrap(), Delta::Add { .. }));
}

#[test]
fn clearing_a_pid_reports_every_region_removed() {
    let tracker = Tracker::new(&config());
    tracker.add_allocation(9, 0, PAGE, "a");
    tracker.add_allocation(9, 2 * PAGE, PAGE, "a");
    let (_, live) = tracker.subscribe();

    tracker.clear_allocations_for_pid(9);
    let mut removed = 0;
    while let Ok(delta) = live.try_recv() {
        assert!(matches!(delta, Delta::Remove { pid: 9, .. }));
        removed += 1;
    }
    assert_eq!(removed, 2);
    assert!(tracker.regions(9).is_empty());
    assert!(tracker.pids().is_empty());
}

#[test]
fn remove_for_unknown_pid_is_absorbed() {
    let tracker = Tracker::new(&config());
    tracker.remove_allocation(1234, 0x1000, PAGE);
    assert!(tracker.catchup_log().is_empty());
}

#[tokio::test]
async fn router_drains_the_stream_until_it_closes() {
    let tracker = Tracker::new(&config());
    let router = global_router(&tracker);
    let (events_tx, events_rx) = flume::bounded(8);
    let task = tokio::spawn(router.run(events_rx));

    events_tx
        .send_async(event(
            3,
            1,
            Payload::MmapEnter {
                requested_addr: 0,
                size: PAGE,
                comm: "cat".into(),
            },
        ))
        .await
        .unwrap();
    events_tx
        .send_async(event(3, 1, Payload::MmapExit { actual_addr: 0x9000 }))
        .await
        .unwrap();
    drop(events_tx);
    task.await.unwrap();

    assert_eq!(tracker.regions(3).len(), 1);
}
