use satexec::integrity::{ProtectedCell, ScrubOutcome, SeuCounters};

#[test]
fn test_single_bitflip_corrected_for_all_replicas_and_bits() {
    for replica in 0..3 {
        for bit in [0u32, 1, 5, 13, 31] {
            let mut cell: ProtectedCell<u32> = ProtectedCell::new(0xCAFE_F00D);
            cell.force_bitflip(replica, bit);
            assert_eq!(cell.scrub(), ScrubOutcome::Corrected);
            assert_eq!(cell.read(), 0xCAFE_F00D);
            // All replicas agree after a successful scrub.
            assert_eq!(cell.scrub(), ScrubOutcome::Clean);
        }
    }
}

#[test]
fn test_double_bitflip_discrete_is_unrecoverable() {
    let mut cell: ProtectedCell<u32> = ProtectedCell::new(1000);
    cell.force_bitflip(0, 2);
    cell.force_bitflip(1, 9);
    assert_eq!(cell.scrub(), ScrubOutcome::Unrecoverable);
}

#[test]
fn test_double_bitflip_float_corrects_via_median() {
    let mut cell: ProtectedCell<f64> = ProtectedCell::new(3.25);
    cell.force_bitflip(0, 1);
    cell.force_bitflip(1, 40);
    assert_eq!(cell.scrub(), ScrubOutcome::Corrected);
    // The untouched replica is the median; the voted value survives.
    assert!((cell.read() - 3.25).abs() < 0.01);
}

#[test]
fn test_boolean_cell_round_trip_under_corruption() {
    let mut cell: ProtectedCell<bool> = ProtectedCell::new(true);
    cell.force_bitflip(2, 0);
    assert!(cell.read());
    assert_eq!(cell.scrub(), ScrubOutcome::Corrected);

    cell.store(false);
    cell.force_bitflip(0, 3);
    assert!(!cell.read());
    assert_eq!(cell.scrub(), ScrubOutcome::Corrected);
}

#[test]
fn test_store_refreshes_replicas_without_voting() {
    let mut cell: ProtectedCell<u16> = ProtectedCell::new(7);
    cell.force_bitflip(0, 0);
    cell.force_bitflip(1, 4);
    // A store resets redundancy to the written value even when the replicas
    // were unrecoverably split.
    cell.store(99);
    assert_eq!(cell.scrub(), ScrubOutcome::Clean);
    assert_eq!(cell.read(), 99);
}

#[test]
fn test_seu_counter_only_counts_unrecoverable() {
    let counters = SeuCounters::new();
    let mut cell: ProtectedCell<u8> = ProtectedCell::new(0x42);

    cell.force_bitflip(1, 6);
    counters.record(cell.scrub());
    assert_eq!(counters.radiation_errors(), 0);
    assert_eq!(counters.corrected(), 1);

    cell.force_bitflip(0, 0);
    cell.force_bitflip(1, 1);
    counters.record(cell.scrub());
    assert_eq!(counters.radiation_errors(), 1);
}

#[test]
fn test_two_replica_cell_detects_without_correcting() {
    let mut cell: ProtectedCell<u32, 2> = ProtectedCell::new(5);
    cell.force_bitflip(1, 16);
    assert_eq!(cell.scrub(), ScrubOutcome::Unrecoverable);
    // Replicas are left untouched for the caller.
    cell.store(5);
    assert_eq!(cell.scrub(), ScrubOutcome::Clean);
}
