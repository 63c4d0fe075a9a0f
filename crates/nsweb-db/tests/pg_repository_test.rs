//! PostgreSQL repository tests. Skipped unless DATABASE_URL is set.

use chrono::Utc;
use nsweb_db::test_fixtures::TestDatabase;
use nsweb_db::{
    Claim, DecodingIdentity, DecodingRepository, DecodingSetRepository, DecodingStatus,
    NewDecoding, PeakRepository,
};

fn new_decoding(set: &nsweb_db::DecodingSet, identity: DecodingIdentity) -> NewDecoding {
    let uuid = nsweb_db::new_decoding_uuid();
    NewDecoding {
        filename: format!("/tmp/{}.nii.gz", uuid),
        uuid,
        identity,
        decoding_set: set.clone(),
        name: "map.nii.gz".into(),
        display: true,
        download: false,
        ip: Some("127.0.0.1".into()),
        image_modified_at: None,
    }
}

#[tokio::test]
async fn test_claim_conflict_returns_existing_row() {
    let Some(mut test_db) = TestDatabase::connect().await else {
        return;
    };
    let set = test_db.seed_decoding_set().await;
    let identity = DecodingIdentity::Url(format!("http://a.org/{}.nii.gz", set.name));

    let first = test_db
        .db
        .decodings
        .claim(new_decoding(&set, identity.clone()))
        .await
        .unwrap();
    let second = test_db
        .db
        .decodings
        .claim(new_decoding(&set, identity.clone()))
        .await
        .unwrap();

    let created = match first {
        Claim::Created(d) => d,
        Claim::Existing(_) => panic!("first claim must insert"),
    };
    match second {
        Claim::Existing(d) => assert_eq!(d.uuid, created.uuid),
        Claim::Created(_) => panic!("second claim must conflict"),
    }

    test_db
        .db
        .decodings
        .mark_complete(created.id, Utc::now())
        .await
        .unwrap();
    let found = test_db
        .db
        .decodings
        .find(&identity, set.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.status, DecodingStatus::Complete);
    assert_eq!(found.decoding_set, set.name);

    let listed = test_db.db.decoding_sets.get_by_name(&set.name).await.unwrap();
    assert_eq!(listed.map(|s| s.id), Some(set.id));

    test_db.cleanup().await;
}

#[tokio::test]
async fn test_find_nearby_groups_by_study() {
    let Some(mut test_db) = TestDatabase::connect().await else {
        return;
    };
    // Far outside the MNI brain so seeded rows do not mix with real data.
    let base = 5000.0;
    let pmid_a = 900_000_000 + (Utc::now().timestamp_subsec_micros() as i64);
    let pmid_b = pmid_a + 1;
    test_db
        .seed_study(pmid_a, &[(base, base, base), (base + 1.0, base, base)])
        .await;
    test_db
        .seed_study(pmid_b, &[(base + 5.0, base + 5.0, base)])
        .await;

    let hits = test_db
        .db
        .peaks
        .find_nearby(base, base, base, 6.0)
        .await
        .unwrap();
    let summary: Vec<(i64, i64)> = hits.iter().map(|h| (h.study.pmid, h.peaks)).collect();
    assert_eq!(summary, vec![(pmid_a, 2)]);

    test_db.cleanup().await;
}
