//! Black-box test of the collection pipeline: text capture in, corpus out.

use std::io::Write;

use tokio_util::sync::CancellationToken;

use queryreplay::codec::BlobReader;
use queryreplay::config::{
    BlobFormat, CacheOutputConfig, CollectConfig, Encoding, InputConfig, InputType, OutputConfig,
    OutputType, PipelineConfig, ProcessorConfig, TsharkTxtInputConfig,
};
use queryreplay::{collect, query};

const CAPTURE: &str = concat!(
    "Jun 23, 2025 10:20:26.262728119 UTC\tSELECT name, email FROM users WHERE id = 42\n",
    "Jun 23, 2025 10:20:27.000000000 UTC\tSELECT name, email FROM users WHERE id = 77\n",
    "Jun 23, 2025 10:20:28.000000000 UTC\tUPDATE orders SET status = 'shipped' WHERE id = 9\n",
    "Jun 23, 2025 10:20:29.000000000 UTC\tSET NAMES utf8\n",
    "not a parseable line\n",
);

fn collect_config(input: &str, output: &str, encoding: Encoding) -> CollectConfig {
    CollectConfig {
        input: InputConfig {
            input_type: Some(InputType::TsharkTxt),
            encoding,
            tshark_txt: TsharkTxtInputConfig {
                file: input.to_string(),
            },
            ..Default::default()
        },
        processor: ProcessorConfig {
            max_concurrency: 2,
            ..Default::default()
        },
        output: OutputConfig {
            output_type: Some(OutputType::Cache),
            encoding: Encoding::Plain,
            cache: CacheOutputConfig {
                file: output.to_string(),
                format: BlobFormat::Queries,
            },
            ..Default::default()
        },
        pipeline: PipelineConfig {
            channel_capacity: 64,
        },
    }
}

async fn run_pipeline(cfg: CollectConfig) -> Vec<(Vec<u8>, u64)> {
    let output = cfg.output.cache.file.clone();
    cfg.validate().unwrap();
    collect::run(cfg, CancellationToken::new()).await.unwrap();

    let blob = std::fs::read(&output).unwrap();
    let mut records = Vec::new();
    let mut reader = BlobReader::new(&blob);
    while let Some(record) = reader.next_record() {
        let record = record.unwrap();
        records.push((record.raw.to_vec(), record.fingerprint_hash));
    }
    records
}

#[tokio::test]
async fn test_text_capture_to_blob_corpus() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("capture.txt");
    let output = dir.path().join("corpus.blob");
    std::fs::write(&input, CAPTURE).unwrap();

    let records = run_pipeline(collect_config(
        input.to_str().unwrap(),
        output.to_str().unwrap(),
        Encoding::Plain,
    ))
    .await;

    // The SET statement and the unparseable line are dropped.
    assert_eq!(records.len(), 3);

    for (raw, fingerprint_hash) in &records {
        assert_ne!(*fingerprint_hash, 0);
        // Keywords are lowercased by normalization.
        assert!(
            raw.starts_with(b"select") || raw.starts_with(b"update"),
            "unexpected record {:?}",
            String::from_utf8_lossy(raw),
        );
    }

    // Literal-only differences share one fingerprint hash.
    let selects: Vec<u64> = records
        .iter()
        .filter(|(raw, _)| raw.starts_with(b"select"))
        .map(|(_, hash)| *hash)
        .collect();
    assert_eq!(selects.len(), 2);
    assert_eq!(selects[0], selects[1]);

    let update = records
        .iter()
        .find(|(raw, _)| raw.starts_with(b"update"))
        .unwrap();
    assert_ne!(update.1, selects[0]);
    assert_eq!(
        update.0,
        b"update orders set status = 'shipped' where id = 9",
    );
}

#[tokio::test]
async fn test_gzip_encoded_capture() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("capture.txt.gz");
    let output = dir.path().join("corpus.blob");

    let file = std::fs::File::create(&input).unwrap();
    let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    encoder.write_all(CAPTURE.as_bytes()).unwrap();
    encoder.finish().unwrap();

    let records = run_pipeline(collect_config(
        input.to_str().unwrap(),
        output.to_str().unwrap(),
        Encoding::Gzip,
    ))
    .await;

    assert_eq!(records.len(), 3);
}

#[tokio::test]
async fn test_metadata_format_records_point_into_capture() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("capture.txt");
    let output = dir.path().join("corpus.meta");
    std::fs::write(&input, CAPTURE).unwrap();

    let mut cfg = collect_config(
        input.to_str().unwrap(),
        output.to_str().unwrap(),
        Encoding::Plain,
    );
    cfg.output.cache.format = BlobFormat::Metadata;

    cfg.validate().unwrap();
    collect::run(cfg, CancellationToken::new()).await.unwrap();

    let data = std::fs::read(&output).unwrap();
    assert_eq!(data.len() % queryreplay::codec::META_RECORD_SIZE, 0);
    assert_eq!(data.len() / queryreplay::codec::META_RECORD_SIZE, 3);

    let capture = std::fs::read(&input).unwrap();
    for chunk in data.chunks(queryreplay::codec::META_RECORD_SIZE) {
        let record = queryreplay::codec::MetaRecord::decode(chunk).unwrap();
        assert_ne!(record.hash, 0);
        assert_ne!(record.fingerprint_hash, 0);

        // Offsets index the original capture; the referenced line must
        // parse back into a tab-separated record.
        let line = &capture[record.offset as usize..(record.offset + record.length) as usize];
        assert!(line.contains(&b'\t'));
    }
}

#[tokio::test]
async fn test_cancellation_is_clean() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("capture.txt");
    let output = dir.path().join("corpus.blob");
    std::fs::write(&input, CAPTURE).unwrap();

    let cfg = collect_config(
        input.to_str().unwrap(),
        output.to_str().unwrap(),
        Encoding::Plain,
    );

    let cancel = CancellationToken::new();
    cancel.cancel();

    // A pre-cancelled run exits cleanly.
    collect::run(cfg, cancel).await.unwrap();
}

#[tokio::test]
async fn test_already_lowercase_raw_is_preserved() {
    // The validity filter lowercases in place, so the corpus stores fully
    // lowercased statements with literals intact.
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("capture.txt");
    let output = dir.path().join("corpus.blob");
    std::fs::write(
        &input,
        "Jun 23, 2025 10:20:26.000000000 UTC\tSELECT Price FROM Products WHERE Sku = 'SKU-9-A'\n",
    )
    .unwrap();

    let records = run_pipeline(collect_config(
        input.to_str().unwrap(),
        output.to_str().unwrap(),
        Encoding::Plain,
    ))
    .await;

    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].0,
        b"select price from products where sku = 'sku-9-a'",
    );

    let mut check = records[0].0.clone();
    assert!(query::is_valid_query(&mut check));
}
