use lumen_core::Error;
use lumen_runtime::KVCache;

fn row(v: f32, kv_dim: usize) -> Vec<f32> {
    vec![v; kv_dim]
}

#[test]
fn test_sequential_writes_fill_every_layer() {
    let mut cache = KVCache::new(3, 4, 8);
    for pos in 0..4 {
        for layer in 0..3 {
            let k = row((layer * 10 + pos) as f32, 8);
            cache.write(layer, pos, &k, &k).unwrap();
        }
    }
    assert_eq!(cache.len(2), 4);
    assert_eq!(cache.keys(1).len(), 4 * 8);
    assert_eq!(cache.keys(2)[3 * 8], 23.0);
    assert_eq!(cache.values(0)[8], 1.0);
}

#[test]
fn test_rewriting_a_position_is_rejected() {
    let mut cache = KVCache::new(1, 4, 2);
    cache.write(0, 0, &row(1.0, 2), &row(1.0, 2)).unwrap();
    cache.write(0, 1, &row(2.0, 2), &row(2.0, 2)).unwrap();

    let err = cache.write(0, 0, &row(9.0, 2), &row(9.0, 2)).unwrap_err();
    assert!(matches!(err, Error::PositionAlreadyWritten { layer: 0, position: 0 }));
    // The original row survives
    assert_eq!(cache.keys(0)[..2], [1.0, 1.0]);
}

#[test]
fn test_writing_past_capacity_is_cache_exhausted() {
    let mut cache = KVCache::new(2, 2, 2);
    cache.write(1, 0, &row(1.0, 2), &row(1.0, 2)).unwrap();
    cache.write(1, 1, &row(1.0, 2), &row(1.0, 2)).unwrap();
    match cache.write(1, 2, &row(1.0, 2), &row(1.0, 2)) {
        Err(Error::CacheExhausted { position, capacity }) => {
            assert_eq!((position, capacity), (2, 2));
        }
        other => panic!("expected CacheExhausted, got {:?}", other),
    }
}

#[test]
fn test_gaps_are_rejected() {
    let mut cache = KVCache::new(1, 8, 2);
    assert!(matches!(
        cache.write(0, 3, &row(1.0, 2), &row(1.0, 2)),
        Err(Error::InvalidArgument(_))
    ));
    assert!(cache.is_empty());
}

#[test]
fn test_reset_allows_rewrite() {
    let mut cache = KVCache::new(2, 2, 2);
    cache.write(0, 0, &row(1.0, 2), &row(1.0, 2)).unwrap();
    cache.write(1, 0, &row(1.0, 2), &row(1.0, 2)).unwrap();
    cache.reset();
    assert!(cache.is_empty());
    assert!(cache.keys(0).is_empty());

    cache.write(0, 0, &row(5.0, 2), &row(6.0, 2)).unwrap();
    assert_eq!(cache.keys(0), &[5.0, 5.0]);
    assert_eq!(cache.values(0), &[6.0, 6.0]);
}
