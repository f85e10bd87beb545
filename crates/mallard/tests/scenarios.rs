//! End-to-end ingest scenarios against the mock log broker, the mock
//! schema registry, and an in-memory DuckDB.

use std::sync::Arc;

use base64::Engine as _;
use mallard::schema::registry::RegistryClient;
use mallard::testing::{frame_payload, MockLogBroker};
use mallard::{
    EngineConfig, IngestEngine, PrimitiveTag, SchemaFamily, SerdeSpec, TopicStatus,
};

fn inline_serde(family: &str, schema: &str) -> SerdeSpec {
    let encoded = base64::engine::general_purpose::STANDARD.encode(schema);
    format!("inline:{family}:{encoded}").parse().unwrap()
}

async fn engine_with(broker: Arc<MockLogBroker>, config: EngineConfig) -> IngestEngine {
    let engine = IngestEngine::builder().source_factory(broker).build();
    engine.configure(config).unwrap();
    engine.init().await.unwrap();
    engine
}

fn avro_datum(schema_text: &str, value: apache_avro::types::Value) -> Vec<u8> {
    let schema = apache_avro::Schema::parse_str(schema_text).unwrap();
    apache_avro::to_avro_datum(&schema, value).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_inline_json_int() {
    let broker = MockLogBroker::new();
    let engine = engine_with(
        broker.clone(),
        EngineConfig::new()
            .with_topic("t1")
            .with_value_serde("t1", inline_serde("json", r#"{"type":"int"}"#)),
    )
    .await;

    broker.produce("t1", 0, None, Some(frame_payload(1, b"42")));
    engine.sync().await.unwrap();

    let conn = engine.connection().unwrap();
    let conn = conn.lock();
    let (key, value): (Option<Vec<u8>>, Option<i64>) = conn
        .query_row("SELECT \"rowkey\", \"value\" FROM \"t1\"", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .unwrap();
    assert_eq!(key, None);
    assert_eq!(value, Some(42));
    drop(conn);
    engine.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_latest_record_schema_flattens_fields() {
    const SCHEMA: &str = r#"{"type":"record","name":"r","fields":[
        {"name":"a","type":"int"},
        {"name":"b","type":"string"}
    ]}"#;

    let registry = RegistryClient::from_urls(&["mock://scenario-latest".to_string()]).unwrap();
    let id = registry
        .register_schema("t2-value", SchemaFamily::Avro, SCHEMA, Vec::new())
        .await
        .unwrap();

    let broker = MockLogBroker::new();
    let engine = engine_with(
        broker.clone(),
        EngineConfig::new()
            .with_topic("t2")
            .with_registry_url("mock://scenario-latest")
            .with_value_serde("t2", SerdeSpec::Latest),
    )
    .await;

    let body = avro_datum(
        SCHEMA,
        apache_avro::types::Value::Record(vec![
            ("a".to_string(), apache_avro::types::Value::Int(7)),
            (
                "b".to_string(),
                apache_avro::types::Value::String("x".to_string()),
            ),
        ]),
    );
    broker.produce("t2", 0, None, Some(frame_payload(id, &body)));
    // A tombstone materializes as a row with all value columns null.
    broker.produce("t2", 0, None, None);
    engine.sync().await.unwrap();

    {
        let conn = engine.connection().unwrap();
        let conn = conn.lock();
        let (a, b): (Option<i32>, Option<String>) = conn
            .query_row(
                "SELECT \"a\", \"b\" FROM \"t2\" WHERE \"a\" IS NOT NULL",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(a, Some(7));
        assert_eq!(b, Some("x".to_string()));

        let tombstones: i64 = conn
            .query_row(
                "SELECT count(*) FROM \"t2\" WHERE \"a\" IS NULL AND \"b\" IS NULL",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tombstones, 1);
    }
    engine.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_unreachable_registry_falls_back_to_binary() {
    let broker = MockLogBroker::new();
    let engine = engine_with(
        broker.clone(),
        EngineConfig::new()
            .with_topic("t3")
            .with_registry_url("http://127.0.0.1:9")
            .with_value_serde("t3", SerdeSpec::Latest),
    )
    .await;

    broker.produce("t3", 0, None, Some(vec![0xde, 0xad]));
    // Every subsequent record of the binding stays binary.
    broker.produce("t3", 0, None, Some(vec![0xbe, 0xef]));
    engine.sync().await.unwrap();

    {
        let conn = engine.connection().unwrap();
        let conn = conn.lock();
        let blobs: Vec<Vec<u8>> = conn
            .prepare("SELECT \"value\" FROM \"t3\"")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(blobs.contains(&vec![0xde, 0xad]));
        assert!(blobs.contains(&vec![0xbe, 0xef]));
    }
    assert_eq!(engine.topic_status("t3"), Some(TopicStatus::Running));
    engine.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_optional_union_collapses_to_nullable_column() {
    const SCHEMA: &str = r#"["null", "string"]"#;
    let broker = MockLogBroker::new();
    let engine = engine_with(
        broker.clone(),
        EngineConfig::new()
            .with_topic("t4")
            .with_value_serde("t4", inline_serde("avro", SCHEMA)),
    )
    .await;

    let some = avro_datum(
        SCHEMA,
        apache_avro::types::Value::Union(
            1,
            Box::new(apache_avro::types::Value::String("hi".to_string())),
        ),
    );
    let none = avro_datum(
        SCHEMA,
        apache_avro::types::Value::Union(0, Box::new(apache_avro::types::Value::Null)),
    );
    broker.produce("t4", 0, None, Some(frame_payload(-1, &some)));
    broker.produce("t4", 0, None, Some(frame_payload(-1, &none)));
    engine.sync().await.unwrap();

    {
        let conn = engine.connection().unwrap();
        let conn = conn.lock();
        let values: Vec<Option<String>> = conn
            .prepare("SELECT \"value\" FROM \"t4\"")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(values.len(), 2);
        assert!(values.contains(&Some("hi".to_string())));
        assert!(values.contains(&None));
    }
    engine.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_decimal_field_is_exact() {
    const SCHEMA: &str = r#"{"type":"record","name":"sale","fields":[
        {"name":"price","type":{"type":"bytes","logicalType":"decimal","precision":10,"scale":2}}
    ]}"#;
    let broker = MockLogBroker::new();
    let engine = engine_with(
        broker.clone(),
        EngineConfig::new()
            .with_topic("t5")
            .with_value_serde("t5", inline_serde("avro", SCHEMA)),
    )
    .await;

    // 123.45 as unscaled 12345, minimal two's complement.
    let body = avro_datum(
        SCHEMA,
        apache_avro::types::Value::Record(vec![(
            "price".to_string(),
            apache_avro::types::Value::Decimal(apache_avro::Decimal::from(&[0x30u8, 0x39])),
        )]),
    );
    broker.produce("t5", 0, None, Some(frame_payload(-1, &body)));
    engine.sync().await.unwrap();

    {
        let conn = engine.connection().unwrap();
        let conn = conn.lock();
        let price: String = conn
            .query_row(
                "SELECT CAST(\"price\" AS VARCHAR) FROM \"t5\"",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(price, "123.45");
    }
    engine.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_concurrent_topics_sync_barrier() {
    let broker = MockLogBroker::new();
    let engine = engine_with(
        broker.clone(),
        EngineConfig::new()
            .with_topic("ta")
            .with_topic("tb")
            .with_value_serde("ta", SerdeSpec::Primitive(PrimitiveTag::Long))
            .with_value_serde("tb", SerdeSpec::Primitive(PrimitiveTag::Long)),
    )
    .await;

    let mut expected_sum = 0i64;
    for i in 0..25i64 {
        for partition in 0..2i32 {
            let value = i64::from(partition) * 1000 + i;
            expected_sum += value;
            broker.produce("ta", partition, None, Some(value.to_be_bytes().to_vec()));
            broker.produce("tb", partition, None, Some(value.to_be_bytes().to_vec()));
        }
    }
    engine.sync().await.unwrap();

    {
        let conn = engine.connection().unwrap();
        let conn = conn.lock();
        for table in ["ta", "tb"] {
            let (count, sum): (i64, i64) = conn
                .query_row(
                    &format!("SELECT count(*), sum(\"value\") FROM \"{table}\""),
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .unwrap();
            assert_eq!(count, 50, "table {table}");
            assert_eq!(sum, expected_sum, "table {table}");
        }
    }

    assert_eq!(engine.topic_metrics("ta").unwrap().rows, 50);
    assert_eq!(engine.topic_metrics("tb").unwrap().rows, 50);
    engine.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn list_value_column_round_trips() {
    const SCHEMA: &str = r#"{"type":"array","items":"long"}"#;
    let broker = MockLogBroker::new();
    let engine = engine_with(
        broker.clone(),
        EngineConfig::new()
            .with_topic("tlist")
            .with_value_serde("tlist", inline_serde("avro", SCHEMA)),
    )
    .await;

    let full = avro_datum(
        SCHEMA,
        apache_avro::types::Value::Array(vec![
            apache_avro::types::Value::Long(5),
            apache_avro::types::Value::Long(6),
            apache_avro::types::Value::Long(7),
        ]),
    );
    let empty = avro_datum(SCHEMA, apache_avro::types::Value::Array(vec![]));
    broker.produce("tlist", 0, None, Some(frame_payload(-1, &full)));
    broker.produce("tlist", 0, None, Some(frame_payload(-1, &empty)));
    engine.sync().await.unwrap();

    {
        let conn = engine.connection().unwrap();
        let conn = conn.lock();
        let rows: Vec<(i64, Option<i64>, Option<i64>)> = conn
            .prepare(
                "SELECT len(\"value\"), \"value\"[1], \"value\"[3] \
                 FROM \"tlist\" ORDER BY 1 DESC",
            )
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(rows, vec![(3, Some(5), Some(7)), (0, None, None)]);

        // The empty sequence is not null.
        let nulls: i64 = conn
            .query_row(
                "SELECT count(*) FROM \"tlist\" WHERE \"value\" IS NULL",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(nulls, 0);
    }
    engine.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn map_value_column_round_trips() {
    const SCHEMA: &str = r#"{"type":"map","values":"long"}"#;
    let broker = MockLogBroker::new();
    let engine = engine_with(
        broker.clone(),
        EngineConfig::new()
            .with_topic("tmap")
            .with_value_serde("tmap", inline_serde("avro", SCHEMA)),
    )
    .await;

    let entries: std::collections::HashMap<String, apache_avro::types::Value> = [
        ("k1".to_string(), apache_avro::types::Value::Long(10)),
        ("k2".to_string(), apache_avro::types::Value::Long(20)),
    ]
    .into_iter()
    .collect();
    let body = avro_datum(SCHEMA, apache_avro::types::Value::Map(entries));
    broker.produce("tmap", 0, None, Some(frame_payload(-1, &body)));
    engine.sync().await.unwrap();

    {
        let conn = engine.connection().unwrap();
        let conn = conn.lock();
        let (size, k1, k2): (i64, Option<i64>, Option<i64>) = conn
            .query_row(
                "SELECT CAST(cardinality(\"value\") AS BIGINT), \
                 \"value\"['k1'], \"value\"['k2'] FROM \"tmap\"",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(size, 2);
        assert_eq!(k1, Some(10));
        assert_eq!(k2, Some(20));
    }
    engine.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_magic_is_counted_and_produces_no_row() {
    let broker = MockLogBroker::new();
    let engine = engine_with(
        broker.clone(),
        EngineConfig::new()
            .with_topic("tm")
            .with_value_serde("tm", inline_serde("avro", r#""long""#)),
    )
    .await;

    broker.produce("tm", 0, None, Some(vec![0x01, 0xff, 0xff]));
    engine.sync().await.unwrap();

    {
        let conn = engine.connection().unwrap();
        let conn = conn.lock();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM \"tm\"", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
    let metrics = engine.topic_metrics("tm").unwrap();
    assert_eq!(metrics.decode_errors, 1);
    assert_eq!(metrics.rows, 0);
    engine.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn primitive_key_and_value_serdes() {
    let broker = MockLogBroker::new();
    let engine = engine_with(
        broker.clone(),
        EngineConfig::new()
            .with_topic("tp")
            .with_key_serde("tp", SerdeSpec::Primitive(PrimitiveTag::String))
            .with_value_serde("tp", SerdeSpec::Primitive(PrimitiveTag::Double)),
    )
    .await;

    broker.produce(
        "tp",
        0,
        Some(b"k1".to_vec()),
        Some(2.5f64.to_be_bytes().to_vec()),
    );
    engine.sync().await.unwrap();

    {
        let conn = engine.connection().unwrap();
        let conn = conn.lock();
        let (key, value): (String, f64) = conn
            .query_row("SELECT \"rowkey\", \"value\" FROM \"tp\"", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(key, "k1");
        assert!((value - 2.5).abs() < f64::EPSILON);
    }
    engine.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn offsets_are_committed_on_close() {
    let broker = MockLogBroker::new();
    let engine = engine_with(
        broker.clone(),
        EngineConfig::new()
            .with_topic("tc")
            .with_value_serde("tc", SerdeSpec::Primitive(PrimitiveTag::Binary)),
    )
    .await;

    broker.produce("tc", 0, None, Some(vec![1]));
    broker.produce("tc", 0, None, Some(vec![2]));
    engine.sync().await.unwrap();
    engine.close().await.unwrap();

    assert_eq!(broker.committed_offset("tc", 0), Some(2));
}

#[tokio::test(flavor = "multi_thread")]
async fn close_drops_the_mock_registry_scope() {
    const SCOPE_URL: &str = "mock://scenario-drop";
    let registry = RegistryClient::from_urls(&[SCOPE_URL.to_string()]).unwrap();
    registry
        .register_schema("td-value", SchemaFamily::Avro, r#""long""#, Vec::new())
        .await
        .unwrap();

    let broker = MockLogBroker::new();
    let engine = engine_with(
        broker.clone(),
        EngineConfig::new()
            .with_topic("td")
            .with_registry_url(SCOPE_URL),
    )
    .await;
    engine.sync().await.unwrap();
    engine.close().await.unwrap();

    let reopened = RegistryClient::from_urls(&[SCOPE_URL.to_string()]).unwrap();
    assert!(reopened.latest_for_subject("td-value").await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn singleton_instance_lifecycle() {
    let first = IngestEngine::instance();
    let second = IngestEngine::instance();
    assert!(Arc::ptr_eq(&first, &second));

    IngestEngine::close_instance().await;
    let third = IngestEngine::instance();
    assert!(!Arc::ptr_eq(&first, &third));
    IngestEngine::close_instance().await;
}
