//! End-to-end keyspace scenarios against a single shard Db.

use super::*;
use crate::geo;

fn db() -> Db {
    Db::new(DbLimits::default())
}

fn no_flags() -> HSetFlags {
    HSetFlags::default()
}

#[test]
fn test_hset_hmget_lifecycle() {
    let mut db = db();
    let created = db
        .hset(b"h", &[(b"f1", b"v1"), (b"f2", b"v2")], no_flags(), 0)
        .unwrap();
    assert_eq!(created, 2);

    let got = db.hmget(b"h", &[b"f1", b"nope", b"f2"], 0).unwrap();
    assert_eq!(
        got,
        vec![Some(b"v1".to_vec()), None, Some(b"v2".to_vec())]
    );

    db.hset(b"h", &[(b"f1", b"newv")], no_flags(), 0).unwrap();
    assert_eq!(db.hget(b"h", b"f1", 0).unwrap(), Some(b"newv".to_vec()));

    assert_eq!(db.hdel(b"h", &[b"f1", b"f2"], 0).unwrap(), 2);
    assert!(!db.hexists(b"h", b"f1", 0).unwrap());
    // Empty container drops the key
    assert!(db.type_of(b"h").is_none());
}

#[test]
fn test_hincr_scenario() {
    let mut db = db();
    assert_eq!(db.hincrby(b"h", b"f", 10, 0).unwrap(), 10);
    assert_eq!(db.hget(b"h", b"f", 0).unwrap(), Some(b"10".to_vec()));
    assert_eq!(db.hincrbyfloat(b"h", b"f", 0.5, 0).unwrap(), 10.5);
    assert_eq!(db.hget(b"h", b"f", 0).unwrap(), Some(b"10.5".to_vec()));
    assert_eq!(
        db.hincrby(b"h", b"f", 1, 0),
        Err(OpStatus::InvalidValue("hash value is not an integer"))
    );
    // Increment on a missing field starts from zero
    assert_eq!(db.hincrby(b"fresh", b"f", 1, 0).unwrap(), 1);
    // A failed increment leaves an existing key untouched
    let mut db2 = Db::new(DbLimits::default());
    db2.hset(b"k", &[(b"f", b"abc")], no_flags(), 0).unwrap();
    assert!(db2.hincrby(b"k", b"f", 1, 0).is_err());
    assert!(db2.type_of(b"k").is_some());
}

#[test]
fn test_hsetex_ttl_validation() {
    let db = db();
    assert!(db.hsetex_ttl_at(0, 0).is_err());
    assert!(db.hsetex_ttl_at((1 << 26) + 1, 0).is_err());
    // The upper bound itself is accepted
    assert_eq!(db.hsetex_ttl_at(1 << 26, 0).unwrap(), (1u64 << 26) * 1000);
    assert_eq!(db.hsetex_ttl_at(10, 1000).unwrap(), 11_000);
}

#[test]
fn test_field_ttl_expires_key() {
    let mut db = db();
    let ttl = HSetFlags { skip_if_exists: false, ttl_at: Some(5_000) };
    db.hset(b"h", &[(b"f", b"v")], ttl, 0).unwrap();
    assert_eq!(db.hlen(b"h", 0).unwrap(), 1);
    assert_eq!(db.hlen(b"h", 5_000).unwrap(), 0);
}

#[test]
fn test_wrong_type_errors() {
    let mut db = db();
    db.hset(b"h", &[(b"f", b"v")], no_flags(), 0).unwrap();
    assert_eq!(
        db.zcard(b"h", 0),
        Err(OpStatus::WrongType)
    );
    assert_eq!(
        db.zadd(b"h", &[(1.0, b"m")], ZAddFlags::default(), false, 0),
        Err(OpStatus::WrongType)
    );
    db.set_string(b"s", b"v");
    assert_eq!(db.hget(b"s", b"f", 0), Err(OpStatus::WrongType));
}

#[test]
fn test_zadd_zrange_scenario() {
    let mut db = db();
    db.zadd(
        b"z",
        &[(1.0, b"a"), (2.0, b"b"), (3.0, b"c")],
        ZAddFlags::default(),
        false,
        0,
    )
    .unwrap();

    let min = ScoreBound { value: 1.0, exclusive: true };
    let max = ScoreBound::inclusive(3.0);
    let got = db
        .zrange_by_score(b"z", &min, &max, false, 0, None, 0)
        .unwrap();
    let names: Vec<&[u8]> = got.iter().map(|(m, _)| m.as_ref()).collect();
    assert_eq!(names, vec![&b"b"[..], b"c"]);

    let all = db.zrange_by_rank(b"z", 0, -1, false, 0).unwrap();
    assert_eq!(
        all.iter().map(|(_, s)| *s).collect::<Vec<_>>(),
        vec![1.0, 2.0, 3.0]
    );

    // XX GT matrix on existing member
    let xx_gt = ZAddFlags { xx: true, gt: true, ..Default::default() };
    db.zadd(b"z", &[(0.0, b"a")], xx_gt, false, 0).unwrap();
    assert_eq!(db.zscore(b"z", b"a", 0).unwrap(), Some(1.0));
    db.zadd(b"z", &[(5.0, b"a")], xx_gt, false, 0).unwrap();
    assert_eq!(db.zscore(b"z", b"a", 0).unwrap(), Some(5.0));

    // XX on a missing key creates nothing
    let xx = ZAddFlags { xx: true, ..Default::default() };
    db.zadd(b"nope", &[(1.0, b"m")], xx, false, 0).unwrap();
    assert!(db.type_of(b"nope").is_none());
}

#[test]
fn test_zrem_drops_empty_key() {
    let mut db = db();
    db.zadd(b"z", &[(1.0, b"a")], ZAddFlags::default(), false, 0)
        .unwrap();
    assert_eq!(db.zrem(b"z", &[b"a"], 0).unwrap(), 1);
    assert!(db.type_of(b"z").is_none());
}

#[test]
fn test_zrangebylex_scenario() {
    let mut db = db();
    db.zadd(
        b"z",
        &[(1.0, b"a"), (1.0, b"b"), (1.0, b"c")],
        ZAddFlags::default(),
        false,
        0,
    )
    .unwrap();
    let min = LexBound::parse(b"[a").unwrap();
    let max = LexBound::parse(b"(c").unwrap();
    let got = db.zrange_by_lex(b"z", &min, &max, false, 0, None, 0).unwrap();
    let names: Vec<&[u8]> = got.iter().map(|(m, _)| m.as_ref()).collect();
    assert_eq!(names, vec![&b"a"[..], b"b"]);
    assert_eq!(
        db.zlexcount(b"z", &LexBound::NegInf, &LexBound::PosInf, 0)
            .unwrap(),
        3
    );
}

#[test]
fn test_zset_combine_and_store() {
    let mut db = db();
    db.zadd(b"z1", &[(1.0, b"x"), (2.0, b"y")], ZAddFlags::default(), false, 0)
        .unwrap();
    db.zadd(b"z2", &[(10.0, b"y"), (3.0, b"w")], ZAddFlags::default(), false, 0)
        .unwrap();

    let result = db
        .zset_combine(&[b"z1", b"z2"], &[1.0, 1.0], AggType::Sum, CombineOp::Union, 0)
        .unwrap();
    assert_eq!(result.len(), 3);
    assert_eq!(result.get(&b"y"[..]).copied(), Some(12.0));

    let stored = db.store_scored(b"dest", result, 0).unwrap();
    assert_eq!(stored, 3);
    assert_eq!(db.zcard(b"dest", 0).unwrap(), 3);

    // Intersection drops non-shared members
    let inter = db
        .zset_combine(&[b"z1", b"z2"], &[1.0, 1.0], AggType::Min, CombineOp::Inter, 0)
        .unwrap();
    assert_eq!(inter.len(), 1);
    assert_eq!(inter.get(&b"y"[..]).copied(), Some(2.0));

    // Storing an empty result leaves no key
    assert_eq!(db.store_scored(b"dest", ScoredMap::new(), 0).unwrap(), 0);
    assert!(db.type_of(b"dest").is_none());
}

#[test]
fn test_plain_set_as_scored_input() {
    let mut db = db();
    let mut value = CompactValue::new();
    let mut set = crate::set::SetContainer::new();
    set.add(b"m1");
    set.add(b"m2");
    value.init_set(Box::new(set));
    db.table.insert(Bytes::from_static(b"s"), value);

    let input = db.scored_input(b"s", 0).unwrap();
    assert_eq!(input.len(), 2);
    assert!(input.iter().all(|(_, s)| *s == 1.0));
}

#[test]
fn test_geo_scenario() {
    let mut db = db();
    let sf = GeoPoint { longitude: -122.4194, latitude: 37.7749 };
    let nyc = GeoPoint { longitude: -73.9857, latitude: 40.7484 };
    db.geoadd(b"g", &[(sf, b"sf"), (nyc, b"nyc")], ZAddFlags::default(), 0)
        .unwrap();

    let dist_km = db
        .geodist(b"g", b"sf", b"nyc", GeoUnit::Kilometers, 0)
        .unwrap()
        .unwrap();
    assert!((dist_km - 4131.1272).abs() < 0.01, "got {dist_km}");

    let pos = db.geopos(b"g", &[b"sf", b"missing"], 0).unwrap();
    let p = pos[0].unwrap();
    assert!((p.longitude - sf.longitude).abs() < 1e-4);
    assert!((p.latitude - sf.latitude).abs() < 1e-4);
    assert!(pos[1].is_none());

    let hits = db
        .geosearch(
            b"g",
            GeoCenter::Member(b"sf"),
            GeoShape::Circle { radius_m: 100_000.0 },
            GeoSort::Asc,
            None,
            false,
            0,
        )
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(&hits[0].member[..], b"sf");

    assert_eq!(
        db.geosearch(
            b"g",
            GeoCenter::Member(b"ghost"),
            GeoShape::Circle { radius_m: 1.0 },
            GeoSort::Unsorted,
            None,
            false,
            0,
        ),
        Err(OpStatus::MemberNotFound)
    );

    let hashes = db.geohash(b"g", &[b"sf"], 0).unwrap();
    assert!(hashes[0].as_ref().unwrap().starts_with("9q8yy"));
}

#[test]
fn test_geosearch_store_with_options_matrix() {
    let mut db = db();
    let sf = GeoPoint { longitude: -122.4194, latitude: 37.7749 };
    let oakland = GeoPoint { longitude: -122.2712, latitude: 37.8044 };
    db.geoadd(b"g", &[(sf, b"sf"), (oakland, b"oakland")], ZAddFlags::default(), 0)
        .unwrap();
    let circle = GeoShape::Circle { radius_m: 100_000.0 };

    // STORE combined with any WITH* option is rejected with the exact
    // literal
    let reply = GeoReplyOpts { with_dist: true, ..Default::default() };
    let store = GeoStoreTarget { dest: b"dst", store_dist: false, unit: GeoUnit::Meters };
    let err = db
        .geosearch_with_options(
            b"g",
            GeoCenter::Member(b"sf"),
            circle,
            GeoSort::Asc,
            None,
            false,
            reply,
            Some(store),
            0,
        )
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "STORE option in GEORADIUS is not compatible with WITHCOORD, WITHDIST and WITHHASH options"
    );
    assert!(db.type_of(b"dst").is_none());

    // Plain STORE scores the destination by position hash
    let outcome = db
        .geosearch_with_options(
            b"g",
            GeoCenter::Member(b"sf"),
            circle,
            GeoSort::Asc,
            None,
            false,
            GeoReplyOpts::default(),
            Some(store),
            0,
        )
        .unwrap();
    assert_eq!(outcome, GeoSearchOutcome::Stored(2));
    assert_eq!(db.zcard(b"dst", 0).unwrap(), 2);
    let hash_score = db.zscore(b"dst", b"sf", 0).unwrap().unwrap();
    assert_eq!(hash_score, geo::score_of(sf));

    // STOREDIST scores by distance in the requested unit
    let dist_store = GeoStoreTarget { dest: b"dst", store_dist: true, unit: GeoUnit::Kilometers };
    db.geosearch_with_options(
        b"g",
        GeoCenter::Member(b"sf"),
        circle,
        GeoSort::Asc,
        None,
        false,
        GeoReplyOpts::default(),
        Some(dist_store),
        0,
    )
    .unwrap();
    let self_dist = db.zscore(b"dst", b"sf", 0).unwrap().unwrap();
    assert!(self_dist < 0.001);
    let oakland_dist = db.zscore(b"dst", b"oakland", 0).unwrap().unwrap();
    assert!(oakland_dist > 10.0 && oakland_dist < 20.0, "got {oakland_dist}");

    // Reply shaping: only the requested fields are populated
    let shaped = db
        .geosearch_with_options(
            b"g",
            GeoCenter::Member(b"sf"),
            circle,
            GeoSort::Asc,
            None,
            false,
            GeoReplyOpts { with_dist: true, with_coord: false, with_hash: true },
            None,
            0,
        )
        .unwrap();
    let GeoSearchOutcome::Hits(items) = shaped else {
        panic!("expected hits")
    };
    assert_eq!(items.len(), 2);
    for item in &items {
        assert!(item.dist_m.is_some());
        assert!(item.hash.is_some());
        assert!(item.point.is_none());
    }
}

#[test]
fn test_key_expiry() {
    let mut db = db();
    db.set_string(b"k", b"v");
    db.set_key_expire_ms(b"k", Some(1_000));
    assert_eq!(db.key_expire_ms(b"k"), Some(1_000));
    // Reads at a later time reap the key
    db.check_expired(b"k", 2_000);
    assert!(db.type_of(b"k").is_none());
}

#[test]
fn test_string_fetch_states() {
    let mut db = db();
    assert_eq!(db.get_string(b"k"), Ok(StringFetch::Missing));
    db.set_string(b"k", b"resident");
    assert_eq!(
        db.get_string(b"k"),
        Ok(StringFetch::Resident(b"resident".to_vec()))
    );

    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
    db.set_string(b"big", &payload);
    let stored_len = {
        let v = db.table.find(b"big").unwrap();
        v.stored_bytes().unwrap().len() as u32
    };
    db.table
        .find_mut_quiet(b"big")
        .unwrap()
        .set_external(0, stored_len);
    match db.get_string(b"big") {
        Ok(StringFetch::External(segment)) => {
            assert_eq!(segment.offset, 0);
            assert_eq!(segment.length, stored_len as usize);
        }
        other => panic!("unexpected {other:?}"),
    }
}
