//! End-to-end scenarios driven through the facade.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use helix_core::execution::UnitDescriptor;
use helix_core::memory::{AddrRange, VmError, VmaFlags, HUGE_PAGE_SIZE};
use helix_core::numa::{AllocPolicy, CoreLocator, PAGE_SIZE};
use helix_core::perf::{ManualCounters, Metric, OptimizationAction};
use helix_core::topology::{CacheDomainId, CoreId, CpuMask, HotplugEvent, NodeId, StaticProbe, TopologyNode, UnitId};
use helix_core::{
    EventTopic, Platform, ScaleConfig, ScaleError, ScaleSubsystem, SubsystemState, SystemEvent, SystemEventListener,
};

const PAGES_PER_NODE: u64 = 4096;
const SAMPLE_NS: u64 = 100_000_000;

struct OnCore(u32);

impl CoreLocator for OnCore {
    fn current_core(&self) -> Option<CoreId> {
        Some(CoreId(self.0))
    }
}

/// 4 nodes, 2 cores each, two cores per cache domain
fn four_nodes() -> StaticProbe {
    StaticProbe::uniform(4, 2, 2, PAGES_PER_NODE, 4).distances(&[
        [0u8, 2, 4, 4],
        [2, 0, 4, 4],
        [4, 4, 0, 2],
        [4, 4, 2, 0],
    ])
}

fn boot() -> (ScaleSubsystem, Arc<ManualCounters>) {
    let (platform, counters) = Platform::software();
    let platform = platform.with_locator(Arc::new(OnCore(0)));
    let config = ScaleConfig {
        max_numa_nodes: 4,
        ..ScaleConfig::small()
    };
    let scale = ScaleSubsystem::boot(config, &four_nodes(), platform).unwrap();
    (scale, counters)
}

#[test]
fn test_boot_reports_topology() {
    let (scale, _) = boot();
    assert_eq!(scale.state(), SubsystemState::Running);
    let topo = scale.topology().unwrap();
    assert_eq!(topo.core_count(), 8);
    assert_eq!(topo.node_count(), 4);
    assert_eq!(topo.distance(NodeId(0), NodeId(1)), 2);
    assert_eq!(topo.nearest_nodes(NodeId(0))[0], NodeId(1));
}

#[test]
fn test_too_many_nodes_refused() {
    let (platform, _) = Platform::software();
    let err = ScaleSubsystem::boot(
        ScaleConfig {
            max_numa_nodes: 2,
            ..ScaleConfig::small()
        },
        &four_nodes(),
        platform,
    )
    .map(|_| ())
    .unwrap_err();
    assert!(matches!(err, ScaleError::Config(_)), "{:?}", err);
}

#[test]
fn test_auto_allocation_avoids_pressured_local_node() {
    let (scale, _) = boot();
    scale
        .allocate_numa(PAGES_PER_NODE * 95 / 100 * PAGE_SIZE, AllocPolicy::Bind(NodeId(0)))
        .unwrap();

    let mut per_node = [0u32; 4];
    for _ in 0..1000 {
        let range = scale.allocate_numa(PAGE_SIZE, AllocPolicy::Auto).unwrap();
        per_node[range.node.0 as usize] += 1;
    }
    assert!(per_node[1] > 500, "placement {:?}", per_node);
    assert_eq!(per_node[0], 0);
}

#[test]
fn test_bind_to_full_node_fails_without_spilling() {
    let (scale, _) = boot();
    scale
        .allocate_numa(PAGES_PER_NODE * PAGE_SIZE, AllocPolicy::Bind(NodeId(3)))
        .unwrap();
    let err = scale.allocate_numa(PAGE_SIZE, AllocPolicy::Bind(NodeId(3))).unwrap_err();
    assert!(matches!(err, ScaleError::Numa(_)), "{:?}", err);
}

#[test]
fn test_map_large_rejects_overlap() {
    let (scale, _) = boot();
    let base = 64 * HUGE_PAGE_SIZE;
    let range = AddrRange::from_len(base, 2 * HUGE_PAGE_SIZE).unwrap();
    let id = scale.map_large(range, VmaFlags::RW).unwrap();

    let overlap = AddrRange::from_len(base + HUGE_PAGE_SIZE, 2 * HUGE_PAGE_SIZE).unwrap();
    assert_eq!(
        scale.map_large(overlap, VmaFlags::RW),
        Err(ScaleError::Vm(VmError::AddressConflict { existing: id }))
    );
}

#[test]
fn test_enqueue_and_affinity() {
    let (scale, _) = boot();
    for id in 0..16 {
        scale.enqueue(Arc::new(UnitDescriptor::batch(id)), 0).unwrap();
    }
    scale.set_affinity(UnitId(3), CpuMask::single(CoreId(5)), 1).unwrap();
    assert_eq!(scale.current_placement(UnitId(3)).unwrap(), (CoreId(5), NodeId(2)));
}

#[test]
fn test_infeasible_deadline_becomes_event() {
    let (scale, _) = boot();
    scale
        .enqueue(Arc::new(UnitDescriptor::realtime(1, 1_000, 5_000)), 0)
        .unwrap();
    let events = scale.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, SystemEvent::DeadlineMissed { unit: UnitId(1), .. })));
    assert!(events.iter().all(|e| e.topic() == EventTopic::Scheduling));
}

#[test]
fn test_hotplug_removal_loses_no_units() {
    let (scale, _) = boot();
    for id in 0..40 {
        scale.enqueue(Arc::new(UnitDescriptor::batch(id)), 0).unwrap();
    }
    let sched = scale.scheduler().unwrap();
    let before = sched.scheduled_units();

    scale.hotplug(HotplugEvent::CoreRemoved(CoreId(1)), 10).unwrap();

    assert_eq!(sched.scheduled_units(), before);
    for id in 0..40 {
        let (core, _) = scale.current_placement(UnitId(id)).unwrap();
        assert_ne!(core, CoreId(1));
    }
    let topo = scale.topology().unwrap();
    assert_eq!(topo.core_count(), 7);
    assert_eq!(topo.generation(), 1);
    assert!(scale.perf().unwrap().ring(CoreId(1)).is_err());
    assert!(scale
        .drain_events()
        .contains(&SystemEvent::TopologyChanged { generation: 1, cores: 7 }));
}

#[test]
fn test_hotplug_addition_reaches_every_component() {
    let (scale, _) = boot();
    let node = TopologyNode::new(CoreId(8), NodeId(3), CacheDomainId(3), 2400);
    assert_eq!(scale.hotplug(HotplugEvent::CoreAdded(node), 5).unwrap(), 0);

    assert_eq!(scale.topology().unwrap().node_of(CoreId(8)), Some(NodeId(3)));
    assert!(scale.perf().unwrap().ring(CoreId(8)).is_ok());
    assert_eq!(scale.scheduler().unwrap().load(CoreId(8)), Some(0));

    let unit = UnitDescriptor::batch(77).with_affinity(CpuMask::single(CoreId(8)));
    assert_eq!(scale.enqueue(Arc::new(unit), 6).unwrap(), CoreId(8));
}

#[test]
fn test_removing_unknown_core_changes_nothing() {
    let (scale, _) = boot();
    assert!(scale.hotplug(HotplugEvent::CoreRemoved(CoreId(42)), 0).is_err());
    assert_eq!(scale.topology().unwrap().generation(), 0);
}

fn run_load(scale: &ScaleSubsystem, counters: &ManualCounters, ticks: std::ops::Range<u64>, util: u64) {
    for t in ticks {
        for core in 0..8 {
            counters.advance(CoreId(core), 1_000_000, util, 2);
        }
        scale.tick(t * SAMPLE_NS).unwrap();
    }
}

#[test]
fn test_regression_drives_auto_tuning() {
    let (scale, counters) = boot();
    let configured = scale.config().balance_interval_ns;

    run_load(&scale, &counters, 0..40, 40);
    let perf = scale.perf().unwrap();
    let base = perf.baseline(CoreId(0), Metric::Utilization).unwrap().unwrap();
    assert!((base - 40.0).abs() < 1e-6);
    assert!(!scale
        .drain_events()
        .iter()
        .any(|e| matches!(e, SystemEvent::PerformanceRegression(_))));

    run_load(&scale, &counters, 40..60, 80);
    let events = scale.drain_events();
    let regressions = events
        .iter()
        .filter(|e| matches!(e, SystemEvent::PerformanceRegression(r) if r.metric == Metric::Utilization))
        .count();
    assert_eq!(regressions, 8);
    assert!(events.iter().any(|e| matches!(e, SystemEvent::TuningApplied(_))));
    assert_eq!(scale.scheduler().unwrap().config().balance_interval_ns, configured / 2);

    let report = scale.get_performance_snapshot(60 * SAMPLE_NS).unwrap();
    assert_eq!(report.cores.len(), 8);
    assert!((report.mean_utilization - 80.0).abs() < 1.0);
}

#[test]
fn test_auto_tuning_can_be_disabled() {
    let (scale, counters) = boot();
    let configured = scale.config().balance_interval_ns;
    scale.set_auto_tuning(false).unwrap();
    run_load(&scale, &counters, 0..40, 40);
    run_load(&scale, &counters, 40..60, 80);
    assert_eq!(scale.scheduler().unwrap().config().balance_interval_ns, configured);
    assert!(!scale
        .drain_events()
        .iter()
        .any(|e| matches!(e, SystemEvent::TuningApplied(_))));
}

#[test]
fn test_false_sharing_reported_within_one_window() {
    let (scale, _) = boot();
    // Cores 0 and 2 sit in different cache domains
    for i in 0..40 {
        scale.record_write(CoreId(0), 0x1000, 8, i).unwrap();
        scale.record_write(CoreId(2), 0x1000 + 32, 8, i).unwrap();
    }
    let summary = scale.tick(10_000_000).unwrap();
    assert_eq!(summary.false_sharing, 1);
    let report = scale
        .drain_events()
        .into_iter()
        .find_map(|e| match e {
            SystemEvent::FalseSharing(r) => Some(r),
            _ => None,
        })
        .unwrap();
    assert_eq!(report.line_addr, 0x1000);
    assert_eq!(report.offenders.len(), 2);
}

#[test]
fn test_listener_sees_events_as_published() {
    struct TopologyWatcher(AtomicUsize);
    impl SystemEventListener for TopologyWatcher {
        fn on_event(&self, _: &SystemEvent) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
        fn topics(&self) -> &[EventTopic] {
            &[EventTopic::Topology]
        }
    }

    let (scale, _) = boot();
    let watcher = Arc::new(TopologyWatcher(AtomicUsize::new(0)));
    scale.subscribe(watcher.clone());
    scale.enqueue(Arc::new(UnitDescriptor::realtime(1, 1_000, 5_000)), 0).unwrap();
    scale.hotplug(HotplugEvent::CoreRemoved(CoreId(7)), 1).unwrap();
    assert_eq!(watcher.0.load(Ordering::Relaxed), 1);
}

#[test]
fn test_optimize_quiet_system() {
    let (scale, counters) = boot();
    run_load(&scale, &counters, 0..3, 20);
    let rec = scale.optimize(3 * SAMPLE_NS).unwrap();
    assert_eq!(rec.action, OptimizationAction::None);
}

#[test]
fn test_shutdown_stops_everything() {
    let (scale, _) = boot();
    scale.enqueue(Arc::new(UnitDescriptor::batch(1)), 0).unwrap();
    scale.shutdown(5).unwrap();
    assert_eq!(scale.state(), SubsystemState::Stopped);
    assert_eq!(
        scale.enqueue(Arc::new(UnitDescriptor::batch(2)), 6).map(|_| ()),
        Err(ScaleError::NotInitialized)
    );
    assert_eq!(scale.tick(7).map(|_| ()), Err(ScaleError::NotInitialized));
    assert_eq!(scale.shutdown(8), Err(ScaleError::NotInitialized));

    let (platform, _) = Platform::software();
    scale.init(&four_nodes(), platform).unwrap();
    assert_eq!(scale.scheduler().unwrap().scheduled_units(), 0);
}
