use turbfetch_core::types::ChunkRange;

#[test]
fn chunk_range_is_half_open() {
    let r = ChunkRange { start: 10, end: 20 };
    assert!(r.contains(10));
    assert!(r.contains(19));
    assert!(!r.contains(20));
    assert_eq!(r.len(), 10);
    assert!(!r.is_empty());
}

#[test]
fn empty_chunk_range() {
    let r = ChunkRange { start: 5, end: 5 };
    assert!(r.is_empty());
    assert_eq!(r.len(), 0);
}

#[test]
fn plan_stops_at_total() {
    let r = ChunkRange::plan(90, 25, 100);
    assert_eq!(r, ChunkRange { start: 90, end: 100 });
    assert!(r.reaches(100));

    let r = ChunkRange::plan(0, 25, 100);
    assert_eq!(r, ChunkRange { start: 0, end: 25 });
    assert!(!r.reaches(100));
}

#[test]
fn plan_is_last_exactly_when_end_meets_total() {
    for resume in 0..40u64 {
        for limit in 1..12u64 {
            let r = ChunkRange::plan(resume, limit, 40);
            assert_eq!(r.end, (resume + limit).min(40));
            assert_eq!(r.reaches(40), resume + limit >= 40);
        }
    }
}
