/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! End-to-end tests of the NVMe dispatcher over the in-process driver.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use iobridge::BridgeError;
use iobridge::Handle;
use iobridge::HandleDiscipline;
use iobridge::RegistryConfig;
use iobridge::ResourceClass;
use iobridge::boundary::dma_ptr;
use nix::errno::Errno;

use crate::AddressFamily;
use crate::CompletionSink;
use crate::CompletionStatus;
use crate::ControllerSpec;
use crate::IoCompletion;
use crate::IoDirection;
use crate::NamespaceSpec;
use crate::NvmeConfig;
use crate::NvmeDispatcher;
use crate::NvmfSubsystemMode;
use crate::NvmfSubtype;
use crate::QpairOptions;
use crate::SoftNvme;
use crate::TargetOptions;
use crate::TransportId;
use crate::TransportName;
use crate::TransportType;
use crate::generic_status;

const SECTOR: usize = 512;
const SECTORS: u64 = 1024;
const WAIT: Duration = Duration::from_secs(2);
const SUBNQN: &str = "nqn.2016-06.io.spdk:cnode1";

fn pci(i: usize) -> String {
    format!("0000:{:02x}:00.0", i + 1)
}

fn soft(controllers: usize) -> SoftNvme {
    (0..controllers).fold(SoftNvme::new(), |nvme, i| {
        nvme.with_controller(
            ControllerSpec::new(&pci(i), &format!("SN{:04}", i))
                .with_namespace(NamespaceSpec::new(SECTOR as u32, SECTORS))
                .with_namespace(NamespaceSpec::new(SECTOR as u32, SECTORS).inactive()),
        )
    })
}

fn dispatcher(provider: SoftNvme) -> NvmeDispatcher<SoftNvme> {
    iobridge_telemetry::initialize_logging_for_test();
    NvmeDispatcher::new(provider)
}

fn all_local() -> TransportId {
    TransportId::pcie("").unwrap()
}

/// Attaches the controller at `traddr` and returns its handle.
fn attach(d: &NvmeDispatcher<SoftNvme>, traddr: &str) -> Handle {
    let mut out = [Handle::INVALID; 1];
    let report = d.probe(&TransportId::pcie(traddr).unwrap(), &mut out).unwrap();
    assert_eq!(report.attached, 1);
    out[0]
}

fn dma(d: &NvmeDispatcher<SoftNvme>, blocks: usize) -> u64 {
    d.dma_malloc(blocks * SECTOR, 4096).unwrap()
}

fn bytes(addr: u64, len: usize) -> &'static mut [u8] {
    // SAFETY: test buffers come from `dma_malloc` and are freed only at the
    // end of each test.
    unsafe { std::slice::from_raw_parts_mut(dma_ptr(addr), len) }
}

#[allow(clippy::too_many_arguments)]
fn submit(
    d: &NvmeDispatcher<SoftNvme>,
    ns: Handle,
    qpair: Handle,
    buf: u64,
    lba: u64,
    count: u32,
    io: &Arc<IoCompletion>,
    direction: IoDirection,
) -> Result<(), BridgeError> {
    // SAFETY: every buffer used here holds `count` blocks and outlives the
    // completion.
    unsafe { d.ns_io_cmd(ns, qpair, buf, lba, count, io, direction) }
}

#[test]
fn test_probe_with_zero_capacity_attaches_nothing() {
    let d = dispatcher(soft(2));
    let report = d.probe(&all_local(), &mut []).unwrap();
    assert_eq!(report.attached, 0);
    assert_eq!(report.declined, 2);
    assert!(report.truncated());
    assert_eq!(d.live(ResourceClass::Controller), 0);
}

#[test]
fn test_probe_never_overflows_output() {
    let d = dispatcher(soft(3));
    let mut out = [Handle::INVALID; 2];
    let report = d.probe(&all_local(), &mut out).unwrap();
    assert_eq!(report.attached, 2);
    assert_eq!(report.declined, 1);
    assert!(out.iter().all(|h| h.is_valid()));
    assert_ne!(out[0], out[1]);
    assert_eq!(d.live(ResourceClass::Controller), 2);

    // Attached controllers are not offered again.
    let rest = d.probe_all(&all_local()).unwrap();
    assert_eq!(rest.len(), 1);
    assert!(!out.contains(&rest[0]));

    for ctrlr in out.iter().chain(&rest) {
        d.detach(*ctrlr).unwrap();
    }
    assert_eq!(d.live(ResourceClass::Controller), 0);
    assert_eq!(d.probe_all(&all_local()).unwrap().len(), 3);
}

#[test]
fn test_probe_failure_before_attach_is_an_error() {
    let d = dispatcher(soft(2).fail_probe_after(0, -19));
    let mut out = [Handle::INVALID; 4];
    let err = d.probe(&all_local(), &mut out).unwrap_err();
    assert_eq!(
        err,
        BridgeError::NativeCallFailed {
            op: "spdk_nvme_probe",
            code: -19
        }
    );
    assert_eq!(d.live(ResourceClass::Controller), 0);
    assert!(out.iter().all(|h| *h == Handle::INVALID));
}

#[test]
fn test_probe_failure_after_attach_keeps_partial_result() {
    let d = dispatcher(soft(3).fail_probe_after(1, -19));
    let mut out = [Handle::INVALID; 4];
    let report = d.probe(&all_local(), &mut out).unwrap();
    assert_eq!(report.attached, 1);
    assert_eq!(d.live(ResourceClass::Controller), 1);
    assert!(d.num_namespaces(out[0]).is_ok());
}

#[test]
fn test_controller_and_namespace_queries() {
    let d = dispatcher(soft(1));
    assert!(d.transport_available(TransportType::Pcie));
    let ctrlr = attach(&d, &pci(0));

    let data = d.controller_data(ctrlr).unwrap();
    assert_eq!(data.serial, "SN0000");
    assert_eq!(data.version_major(), 1);
    assert!(d.controller_options(ctrlr).unwrap().num_io_queues > 0);
    assert_eq!(d.process_admin_completions(ctrlr).unwrap(), 0);
    assert_eq!(d.num_namespaces(ctrlr).unwrap(), 2);

    let ns = d.namespace(ctrlr, 1).unwrap();
    assert_eq!(d.namespace(ctrlr, 1).unwrap(), ns);
    assert!(d.ns_is_active(ns).unwrap());
    assert_eq!(d.ns_sector_size(ns).unwrap(), SECTOR as u32);
    assert_eq!(d.ns_size(ns).unwrap(), SECTORS * SECTOR as u64);
    assert_eq!(d.ns_max_io_xfer_size(ns).unwrap(), 128 * 1024);

    let inactive = d.namespace(ctrlr, 2).unwrap();
    assert!(!d.ns_is_active(inactive).unwrap());
    assert!(matches!(d.namespace(ctrlr, 0), Err(BridgeError::InvalidArgument(_))));
    assert!(matches!(d.namespace(ctrlr, 3), Err(BridgeError::InvalidArgument(_))));
    assert_eq!(d.live(ResourceClass::Namespace), 2);
}

#[test]
fn test_write_then_read_round_trip() {
    let d = dispatcher(soft(1));
    let ctrlr = attach(&d, &pci(0));
    let ns = d.namespace(ctrlr, 1).unwrap();
    let qpair = d.alloc_io_qpair(ctrlr).unwrap();
    let sink = CompletionSink::new(8);

    let src = dma(&d, 4);
    for (i, b) in bytes(src, 4 * SECTOR).iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    let write = IoCompletion::new(1, &sink);
    submit(&d, ns, qpair, src, 10, 4, &write, IoDirection::Write).unwrap();
    assert_eq!(write.status(), None);
    assert_eq!(d.wait_for_completions(qpair, &sink, 1, WAIT).unwrap(), 1);
    assert_eq!(write.status(), Some(CompletionStatus::SUCCESS));
    assert_eq!(sink.drain(), vec![1]);

    let dst = dma(&d, 4);
    let read = IoCompletion::new(2, &sink);
    submit(&d, ns, qpair, dst, 10, 4, &read, IoDirection::Read).unwrap();
    d.wait_for_completions(qpair, &sink, 1, WAIT).unwrap();
    assert_eq!(read.status(), Some(CompletionStatus::SUCCESS));
    assert_eq!(bytes(dst, 4 * SECTOR), bytes(src, 4 * SECTOR));

    // Unwritten blocks read as zeroes.
    read.reset();
    submit(&d, ns, qpair, dst, 500, 1, &read, IoDirection::Read).unwrap();
    d.wait_for_completions(qpair, &sink, 2, WAIT).unwrap();
    assert!(bytes(dst, SECTOR).iter().all(|b| *b == 0));

    // SAFETY: no command uses the buffers anymore.
    unsafe {
        d.dma_free(src).unwrap();
        d.dma_free(dst).unwrap();
    }
    assert_eq!(d.provider().dma_allocations(), 0);
    d.free_io_qpair(qpair).unwrap();
    d.detach(ctrlr).unwrap();
}

#[test]
fn test_completions_surface_every_id_with_its_status() {
    let d = dispatcher(soft(1));
    let ctrlr = attach(&d, &pci(0));
    let ns = d.namespace(ctrlr, 1).unwrap();
    let inactive = d.namespace(ctrlr, 2).unwrap();
    let qpair = d.alloc_io_qpair(ctrlr).unwrap();
    let sink = CompletionSink::new(8);
    let buf = dma(&d, 2);

    let ok = IoCompletion::new(1, &sink);
    let out_of_range = IoCompletion::new(2, &sink);
    let empty = IoCompletion::new(3, &sink);
    let wrong_ns = IoCompletion::new(4, &sink);
    submit(&d, ns, qpair, buf, 0, 2, &ok, IoDirection::Write).unwrap();
    submit(&d, ns, qpair, buf, SECTORS - 1, 2, &out_of_range, IoDirection::Read).unwrap();
    submit(&d, ns, qpair, buf, 0, 0, &empty, IoDirection::Read).unwrap();
    submit(&d, inactive, qpair, buf, 0, 1, &wrong_ns, IoDirection::Read).unwrap();

    assert_eq!(d.wait_for_completions(qpair, &sink, 4, WAIT).unwrap(), 4);
    let ids = sink.drain();
    assert_eq!(ids.len(), 4);
    assert_eq!(ids.iter().copied().collect::<HashSet<_>>(), HashSet::from([1, 2, 3, 4]));

    assert_eq!(ok.status(), Some(CompletionStatus::SUCCESS));
    let status = out_of_range.status().unwrap();
    assert_eq!((status.sct, status.sc), (0, 0x80));
    assert!(status.is_error());
    assert_eq!(empty.status().unwrap().sc, generic_status::INVALID_FIELD);
    assert_eq!(
        wrong_ns.status().unwrap().sc,
        generic_status::INVALID_NAMESPACE_OR_FORMAT
    );
}

#[test]
fn test_process_completions_honors_max() {
    let d = dispatcher(soft(1));
    let ctrlr = attach(&d, &pci(0));
    let ns = d.namespace(ctrlr, 1).unwrap();
    let qpair = d.alloc_io_qpair(ctrlr).unwrap();
    let sink = CompletionSink::new(8);
    let buf = dma(&d, 1);
    let records: Vec<_> = (1..=5).map(|id| IoCompletion::new(id, &sink)).collect();
    for (lba, io) in records.iter().enumerate() {
        submit(&d, ns, qpair, buf, lba as u64, 1, io, IoDirection::Read).unwrap();
    }
    assert_eq!(d.qpair_process_completions(qpair, 2).unwrap(), 2);
    assert_eq!(sink.drain(), vec![1, 2]);
    assert_eq!(d.qpair_process_completions(qpair, 0).unwrap(), 3);
    assert_eq!(sink.drain(), vec![3, 4, 5]);
    assert_eq!(d.qpair_process_completions(qpair, 0).unwrap(), 0);
}

#[test]
fn test_wait_for_completions_limits() {
    let d = dispatcher(soft(1));
    let ctrlr = attach(&d, &pci(0));
    let qpair = d.alloc_io_qpair(ctrlr).unwrap();
    let sink = CompletionSink::new(2);

    let err = d.wait_for_completions(qpair, &sink, 3, WAIT).unwrap_err();
    assert_eq!(
        err,
        BridgeError::CapacityExceeded {
            capacity: 2,
            requested: 3
        }
    );

    let timeout = Duration::from_millis(50);
    let start = Instant::now();
    let err = d.wait_for_completions(qpair, &sink, 1, timeout).unwrap_err();
    assert_eq!(err, BridgeError::Timeout(timeout));
    assert!(start.elapsed() >= timeout);
    assert!(start.elapsed() < WAIT);
}

#[test]
fn test_sink_overflow_is_observable() {
    let d = dispatcher(soft(1));
    let ctrlr = attach(&d, &pci(0));
    let ns = d.namespace(ctrlr, 1).unwrap();
    let qpair = d.alloc_io_qpair(ctrlr).unwrap();
    let sink = CompletionSink::new(2);
    let buf = dma(&d, 1);
    let records: Vec<_> = (1..=3).map(|id| IoCompletion::new(id, &sink)).collect();
    for io in &records {
        submit(&d, ns, qpair, buf, 0, 1, io, IoDirection::Read).unwrap();
    }
    assert_eq!(d.qpair_process_completions(qpair, 0).unwrap(), 3);
    assert_eq!(sink.overflowed(), 1);
    assert_eq!(sink.drain(), vec![1, 2]);
    assert!(records.iter().all(|io| io.is_done()));
}

#[test]
fn test_detach_cascades_namespaces_and_waits_for_qpairs() {
    let d = dispatcher(soft(1));
    let ctrlr = attach(&d, &pci(0));
    let ns = d.namespace(ctrlr, 1).unwrap();
    let qpair = d.alloc_io_qpair(ctrlr).unwrap();

    let err = d.detach(ctrlr).unwrap_err();
    assert_eq!(
        err,
        BridgeError::ResourceBusy {
            class: ResourceClass::Controller,
            handle: ctrlr,
            children: 1
        }
    );
    assert!(d.ns_is_active(ns).unwrap());

    d.free_io_qpair(qpair).unwrap();
    assert!(matches!(d.free_io_qpair(qpair), Err(BridgeError::NotFound { .. })));
    d.detach(ctrlr).unwrap();
    assert_eq!(
        d.ns_size(ns).unwrap_err(),
        BridgeError::NotFound {
            class: ResourceClass::Namespace,
            handle: ns
        }
    );
    assert!(matches!(d.detach(ctrlr), Err(BridgeError::NotFound { .. })));
    assert_eq!(d.registry().edge_count(), 0);
}

#[test]
fn test_freeing_qpair_aborts_outstanding_commands() {
    let d = dispatcher(soft(1));
    let ctrlr = attach(&d, &pci(0));
    let ns = d.namespace(ctrlr, 1).unwrap();
    let qpair = d.alloc_io_qpair(ctrlr).unwrap();
    let sink = CompletionSink::new(4);
    let buf = dma(&d, 1);
    let io = IoCompletion::new(9, &sink);
    submit(&d, ns, qpair, buf, 0, 1, &io, IoDirection::Write).unwrap();

    d.free_io_qpair(qpair).unwrap();
    assert_eq!(
        io.status(),
        Some(CompletionStatus::generic(generic_status::ABORTED_SQ_DELETION))
    );
    assert_eq!(sink.drain(), vec![9]);
}

#[test]
fn test_stale_qpair_handle_stays_dead_after_reallocation() {
    let d = dispatcher(soft(1));
    let ctrlr = attach(&d, &pci(0));
    let ns = d.namespace(ctrlr, 1).unwrap();
    let stale = d.alloc_io_qpair(ctrlr).unwrap();
    d.free_io_qpair(stale).unwrap();
    let live = d.alloc_io_qpair(ctrlr).unwrap();
    assert_ne!(stale, live);

    let not_found = BridgeError::NotFound {
        class: ResourceClass::NvmeQueuePair,
        handle: stale,
    };
    assert_eq!(d.free_io_qpair(stale).unwrap_err(), not_found);
    assert_eq!(d.qpair_process_completions(stale, 0).unwrap_err(), not_found);

    let sink = CompletionSink::new(1);
    let buf = dma(&d, 1);
    let io = IoCompletion::new(5, &sink);
    submit(&d, ns, live, buf, 0, 1, &io, IoDirection::Write).unwrap();
    assert_eq!(d.qpair_process_completions(live, 0).unwrap(), 1);
    assert_eq!(io.status(), Some(CompletionStatus::SUCCESS));
    d.free_io_qpair(live).unwrap();
    // SAFETY: no command references the buffer any more.
    unsafe { d.dma_free(buf) }.unwrap();
}

#[test]
fn test_submission_failures_never_complete() {
    let d = dispatcher(soft(2));
    let first = attach(&d, &pci(0));
    let second = attach(&d, &pci(1));
    let ns = d.namespace(first, 1).unwrap();
    let opts = QpairOptions {
        io_queue_requests: 1,
        ..QpairOptions::default()
    };
    let qpair = d.alloc_io_qpair_with(first, &opts).unwrap();
    let other_qpair = d.alloc_io_qpair(second).unwrap();
    let sink = CompletionSink::new(4);
    let buf = dma(&d, 1);

    let queued = IoCompletion::new(1, &sink);
    submit(&d, ns, qpair, buf, 0, 1, &queued, IoDirection::Read).unwrap();
    let rejected = IoCompletion::new(2, &sink);
    let err = submit(&d, ns, qpair, buf, 0, 1, &rejected, IoDirection::Read).unwrap_err();
    assert_eq!(err, BridgeError::errno("spdk_nvme_ns_cmd", Errno::ENOMEM));

    let crossed = IoCompletion::new(3, &sink);
    assert!(matches!(
        submit(&d, ns, other_qpair, buf, 0, 1, &crossed, IoDirection::Read),
        Err(BridgeError::InvalidArgument(_))
    ));
    assert!(matches!(
        submit(&d, ns, qpair, 0, 0, 1, &crossed, IoDirection::Read),
        Err(BridgeError::InvalidArgument(_))
    ));

    assert_eq!(d.qpair_process_completions(qpair, 0).unwrap(), 1);
    assert_eq!(sink.drain(), vec![1]);
    assert_eq!(rejected.status(), None);
    assert_eq!(crossed.status(), None);
}

#[test]
fn test_qpair_allocation_is_bounded_by_controller() {
    let nvme = SoftNvme::new().with_controller(
        ControllerSpec::new(&pci(0), "SN")
            .with_namespace(NamespaceSpec::new(SECTOR as u32, SECTORS))
            .with_io_queues(1),
    );
    let d = dispatcher(nvme);
    let ctrlr = attach(&d, &pci(0));
    let qpair = d.alloc_io_qpair(ctrlr).unwrap();
    assert_eq!(
        d.alloc_io_qpair(ctrlr).unwrap_err(),
        BridgeError::AllocationFailed {
            class: ResourceClass::NvmeQueuePair
        }
    );
    let zero = QpairOptions {
        io_queue_requests: 0,
        ..QpairOptions::default()
    };
    assert!(matches!(
        d.alloc_io_qpair_with(ctrlr, &zero),
        Err(BridgeError::InvalidArgument(_))
    ));
    d.free_io_qpair(qpair).unwrap();
    assert!(d.alloc_io_qpair(ctrlr).is_ok());
}

#[test]
fn test_target_exports_controller_over_fabric() {
    let d = dispatcher(soft(1));
    let local = attach(&d, &pci(0));
    let local_ns = d.namespace(local, 1).unwrap();
    let local_qpair = d.alloc_io_qpair(local).unwrap();
    let sink = CompletionSink::new(4);

    let src = dma(&d, 1);
    bytes(src, SECTOR).fill(0x5a);
    let write = IoCompletion::new(1, &sink);
    submit(&d, local_ns, local_qpair, src, 7, 1, &write, IoDirection::Write).unwrap();
    d.wait_for_completions(local_qpair, &sink, 1, WAIT).unwrap();
    sink.drain();

    let trid = TransportId::rdma(AddressFamily::Ipv4, "192.168.0.10", "4420", SUBNQN).unwrap();
    assert_eq!(
        d.probe(&trid, &mut [Handle::INVALID; 1]).unwrap_err(),
        BridgeError::errno("spdk_nvme_probe", Errno::ECONNREFUSED)
    );

    assert!(d.create_subsystem(SUBNQN, NvmfSubtype::Nvme, NvmfSubsystemMode::Direct).is_err());
    d.target_init(&TargetOptions::default()).unwrap();
    assert!(d.target_init(&TargetOptions::default()).is_err());
    let subsystem = d
        .create_subsystem(SUBNQN, NvmfSubtype::Nvme, NvmfSubsystemMode::Direct)
        .unwrap();
    assert!(matches!(
        d.create_subsystem(SUBNQN, NvmfSubtype::Nvme, NvmfSubsystemMode::Direct),
        Err(BridgeError::AllocationFailed { .. })
    ));
    assert!(matches!(
        d.create_subsystem("cnode2", NvmfSubtype::Nvme, NvmfSubsystemMode::Direct),
        Err(BridgeError::InvalidArgument(_))
    ));
    d.subsystem_add_listener(subsystem, TransportName::Rdma, "192.168.0.10", "4420")
        .unwrap();
    d.subsystem_add_ctrlr(subsystem, local, &pci(0)).unwrap();
    assert_eq!(d.subsystem_poll(subsystem).unwrap(), 0);

    let remote = d.probe_all(&trid).unwrap();
    assert_eq!(remote.len(), 1);
    assert_eq!(d.subsystem_poll(subsystem).unwrap(), 1);
    assert_eq!(d.subsystem_poll(subsystem).unwrap(), 0);

    let remote_ns = d.namespace(remote[0], 1).unwrap();
    let remote_qpair = d.alloc_io_qpair(remote[0]).unwrap();
    let dst = dma(&d, 1);
    let read = IoCompletion::new(2, &sink);
    submit(&d, remote_ns, remote_qpair, dst, 7, 1, &read, IoDirection::Read).unwrap();
    d.wait_for_completions(remote_qpair, &sink, 1, WAIT).unwrap();
    assert!(bytes(dst, SECTOR).iter().all(|b| *b == 0x5a));

    // The native detach refuses an exported controller; the handles survive.
    d.free_io_qpair(local_qpair).unwrap();
    assert_eq!(
        d.detach(local).unwrap_err(),
        BridgeError::errno("spdk_nvme_detach", Errno::EBUSY)
    );
    assert!(d.ns_is_active(local_ns).unwrap());
    assert_eq!(d.namespace(local, 1).unwrap(), local_ns);

    let busy = BridgeError::errno("spdk_nvmf_tgt_fini", Errno::EBUSY);
    assert_eq!(d.target_fini().unwrap_err(), busy);
    d.delete_subsystem(subsystem).unwrap();
    assert!(matches!(d.subsystem_poll(subsystem), Err(BridgeError::NotFound { .. })));
    d.detach(local).unwrap();
    d.free_io_qpair(remote_qpair).unwrap();
    d.detach(remote[0]).unwrap();
    d.target_fini().unwrap();
    assert_eq!(d.registry().edge_count(), 0);
}

#[test]
fn test_discovery_subsystem_exports_nothing() {
    let d = dispatcher(soft(1));
    let ctrlr = attach(&d, &pci(0));
    d.target_init(&TargetOptions::default()).unwrap();
    let discovery = d
        .create_subsystem(crate::DISCOVERY_NQN, NvmfSubtype::Discovery, NvmfSubsystemMode::Direct)
        .unwrap();
    assert_eq!(
        d.subsystem_add_ctrlr(discovery, ctrlr, &pci(0)).unwrap_err(),
        BridgeError::errno("spdk_nvmf_subsystem_add_ctrlr", Errno::EINVAL)
    );
    assert!(matches!(
        d.subsystem_add_listener(discovery, TransportName::Rdma, "", "4420"),
        Err(BridgeError::InvalidArgument(_))
    ));
    d.delete_subsystem(discovery).unwrap();
    d.detach(ctrlr).unwrap();
}

#[test]
fn test_unknown_handles_are_not_found() {
    let d = dispatcher(soft(1));
    let bogus = Handle::from_raw(0xdead_0000);
    assert!(matches!(d.num_namespaces(bogus), Err(BridgeError::NotFound { .. })));
    assert!(matches!(d.ns_size(bogus), Err(BridgeError::NotFound { .. })));
    assert!(matches!(
        d.qpair_process_completions(bogus, 0),
        Err(BridgeError::NotFound { .. })
    ));
    assert!(matches!(d.subsystem_poll(bogus), Err(BridgeError::NotFound { .. })));
    assert!(matches!(d.dma_malloc(0, 4096), Err(BridgeError::InvalidArgument(_))));
    assert!(matches!(d.dma_malloc(64, 48), Err(BridgeError::InvalidArgument(_))));
}

#[test]
fn test_direct_discipline_round_trip() {
    iobridge_telemetry::initialize_logging_for_test();
    let config = NvmeConfig {
        registry: RegistryConfig {
            discipline: HandleDiscipline::Direct,
        },
        ..NvmeConfig::default()
    };
    // SAFETY: the test destroys every handle exactly once, after its last use.
    let d = unsafe { NvmeDispatcher::with_config(soft(1), config) };
    let ctrlr = attach(&d, &pci(0));
    let ns = d.namespace(ctrlr, 1).unwrap();
    let qpair = d.alloc_io_qpair(ctrlr).unwrap();
    assert_eq!(d.live(ResourceClass::Controller), 0);

    let sink = CompletionSink::new(2);
    let buf = dma(&d, 1);
    bytes(buf, SECTOR).fill(3);
    let io = IoCompletion::new(1, &sink);
    submit(&d, ns, qpair, buf, 0, 1, &io, IoDirection::Write).unwrap();
    d.wait_for_completions(qpair, &sink, 1, WAIT).unwrap();
    assert_eq!(io.status(), Some(CompletionStatus::SUCCESS));

    d.free_io_qpair(qpair).unwrap();
    d.detach(ctrlr).unwrap();

    // Live subsystems are only known to the native target here.
    d.target_init(&TargetOptions::default()).unwrap();
    let subsystem = d
        .create_subsystem(SUBNQN, NvmfSubtype::Nvme, NvmfSubsystemMode::Direct)
        .unwrap();
    assert_eq!(d.live(ResourceClass::Subsystem), 0);
    assert_eq!(
        d.target_fini().unwrap_err(),
        BridgeError::errno("spdk_nvmf_tgt_fini", Errno::EBUSY)
    );
    d.delete_subsystem(subsystem).unwrap();
    d.target_fini().unwrap();
}
