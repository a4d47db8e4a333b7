//! End to end batches over the headless device
use std::time::Duration;

use anyhow::Result;
use dare_streaming::headless::{HeadlessConfig, HeadlessDevice};
use dare_streaming::prelude::*;
use rand::Rng;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn engine(config: HeadlessConfig) -> Result<StreamingEngine<HeadlessDevice>> {
    init_tracing();
    Ok(StreamingEngine::new(
        HeadlessDevice::new(config),
        StreamingConfig {
            label: String::from("test streaming"),
        },
    )?)
}

fn random_rgba8(width: u32, height: u32) -> Vec<u8> {
    let mut rng = rand::rng();
    (0..width * height * 4).map(|_| rng.random()).collect()
}

fn finish(engine: &mut StreamingEngine<HeadlessDevice>, batch: SubmittedBatch) -> Result<usize> {
    let completed = engine.wait_for_copy_queue(batch)?;
    Ok(engine.after_execution(completed))
}

#[test]
fn test_single_256_texture() -> Result<()> {
    let mut engine = engine(HeadlessConfig::default())?;
    let key = engine.create_resource();
    let pixels = random_rgba8(256, 256);
    assert_eq!(pixels.len(), 262144);
    engine.register_load_request(LoadRequest::new(
        key,
        PixelData::tightly_packed(pixels.clone(), 256, PixelFormat::Rgba8Unorm),
        256,
        256,
        PixelFormat::Rgba8Unorm,
        0,
    )?);

    let batch = engine.execute()?;
    assert!(!engine.is_valid(key));
    assert_eq!(finish(&mut engine, batch)?, 1);
    assert!(engine.is_valid(key));

    let resource = engine.resource(key).expect("resource exists");
    let image = resource.image().expect("loaded resource owns its image");
    assert_eq!(image.read_texels(), pixels);
    assert_eq!(image.layout(), ImageLayout::ShaderReadOnly);
    assert_eq!(engine.device().view(0).map(|view| view.image_id), Some(image.id()));
    Ok(())
}

#[test]
fn test_three_resources_one_signal() -> Result<()> {
    let mut engine = engine(HeadlessConfig::default())?;
    let keys: Vec<_> = (0..3).map(|_| engine.create_resource()).collect();
    for (slot, key) in keys.iter().enumerate() {
        engine.register_load_request(LoadRequest::new(
            *key,
            PixelData::tightly_packed(random_rgba8(16, 16), 16, PixelFormat::Rgba8Unorm),
            16,
            16,
            PixelFormat::Rgba8Unorm,
            slot as u32,
        )?);
    }

    let batch = engine.execute()?;
    assert_eq!(batch.len(), 3);
    assert_eq!(finish(&mut engine, batch)?, 3);
    assert_eq!(engine.device().stats().signals, 1);
    assert_eq!(engine.device().stats().submissions, 1);
    assert!(keys.iter().all(|key| engine.is_valid(*key)));
    assert_eq!(engine.device().view_table().occupied(), 3);
    Ok(())
}

#[test]
fn test_wait_before_any_execute() -> Result<()> {
    let engine = engine(HeadlessConfig::default())?;
    engine.fence().wait_for_completion()?;
    assert_eq!(engine.fence().value_to_wait_for(), 0);
    Ok(())
}

#[test]
fn test_padded_source_rows_land_byte_exact() -> Result<()> {
    // 3 pixel rows are 12 bytes; the source pads to 16 and the device aligns staging rows to 64
    let mut engine = engine(HeadlessConfig {
        copy_row_pitch_alignment: 64,
        ..Default::default()
    })?;
    let texels: Vec<[u8; 4]> = (0..9u8).map(|i| [i, i + 1, i + 2, 255]).collect();
    let mut padded = Vec::new();
    for row in texels.chunks(3) {
        padded.extend_from_slice(bytemuck::cast_slice(row));
        padded.extend_from_slice(&[0xAA; 4]);
    }
    padded.truncate(16 * 2 + 12);

    let key = engine.create_resource();
    engine.register_load_request(LoadRequest::new(
        key,
        PixelData::new(padded, 16, 16 * 3),
        3,
        3,
        PixelFormat::Rgba8Unorm,
        7,
    )?);
    let batch = engine.execute()?;
    finish(&mut engine, batch)?;

    let image = engine
        .resource(key)
        .and_then(StreamableResource::image)
        .expect("loaded resource owns its image");
    let expected: &[u8] = bytemuck::cast_slice(&texels);
    assert_eq!(image.read_texels(), expected);
    Ok(())
}

#[test]
fn test_float_texels() -> Result<()> {
    let mut engine = engine(HeadlessConfig::default())?;
    let texels: Vec<[f32; 4]> = (0..4).map(|i| [i as f32, 0.5, 0.25, 1.0]).collect();
    let bytes = bytemuck::cast_slice::<_, u8>(&texels).to_vec();
    let key = engine.create_resource();
    engine.register_load_request(LoadRequest::new(
        key,
        PixelData::tightly_packed(bytes.clone(), 2, PixelFormat::Rgba32Float),
        2,
        2,
        PixelFormat::Rgba32Float,
        1,
    )?);
    let batch = engine.execute()?;
    finish(&mut engine, batch)?;
    let image = engine
        .resource(key)
        .and_then(StreamableResource::image)
        .expect("loaded resource owns its image");
    assert_eq!(image.read_texels(), bytes);
    Ok(())
}

#[test]
fn test_requests_from_producer_thread() -> Result<()> {
    let mut engine = engine(HeadlessConfig {
        copy_latency: Duration::from_millis(5),
        ..Default::default()
    })?;
    let keys: Vec<_> = (0..8).map(|_| engine.create_resource()).collect();
    let sender = engine.request_sender();
    let producer_keys = keys.clone();
    let producer = std::thread::spawn(move || -> Result<()> {
        for (slot, key) in producer_keys.into_iter().enumerate() {
            let request = LoadRequest::new(
                key,
                PixelData::tightly_packed(random_rgba8(8, 8), 8, PixelFormat::Rgba8Unorm),
                8,
                8,
                PixelFormat::Rgba8Unorm,
                slot as u32,
            )?;
            sender
                .send(request)
                .map_err(|_| anyhow::anyhow!("engine dropped"))?;
        }
        Ok(())
    });
    producer.join().expect("producer panicked")?;
    assert_eq!(engine.pending_len(), 8);

    let batch = engine.execute()?;
    assert_eq!(batch.len(), 8);
    assert_eq!(finish(&mut engine, batch)?, 8);
    assert!(keys.iter().all(|key| engine.is_valid(*key)));
    Ok(())
}

#[test]
fn test_retry_after_out_of_memory() -> Result<()> {
    // room for a single 64x64 RGBA8 image
    let mut engine = engine(HeadlessConfig {
        device_memory_budget: Some(64 * 64 * 4),
        ..Default::default()
    })?;
    let request = |key, slot| {
        LoadRequest::new(
            key,
            PixelData::tightly_packed(random_rgba8(64, 64), 64, PixelFormat::Rgba8Unorm),
            64,
            64,
            PixelFormat::Rgba8Unorm,
            slot,
        )
    };
    let first = engine.create_resource();
    let second = engine.create_resource();
    engine.register_load_request(request(first, 0)?);
    let batch = engine.execute()?;
    finish(&mut engine, batch)?;

    engine.register_load_request(request(second, 1)?);
    let err = engine.execute().expect_err("second image does not fit");
    assert_eq!(err, StreamError::OutOfMemory(MemoryLocation::Device));
    assert!(err.is_retryable());
    assert_eq!(engine.state(), EngineState::Idle);
    assert_eq!(engine.pending_len(), 1);
    assert_eq!(
        engine.resource(second).map(StreamableResource::state),
        Some(ResourceState::Unloaded)
    );

    // make room and retry the same request
    engine.start_unload(first, 0)?;
    engine.end_unload(first);
    let batch = engine.execute()?;
    assert_eq!(finish(&mut engine, batch)?, 1);
    assert!(engine.is_valid(second));
    assert!(!engine.is_valid(first));
    Ok(())
}

#[test]
fn test_unload_and_reload_cycle() -> Result<()> {
    let mut engine = engine(HeadlessConfig::default())?;
    let key = engine.create_resource();
    for round in 0..3u8 {
        let pixels = vec![round; 4 * 4 * 4];
        engine.register_load_request(LoadRequest::new(
            key,
            PixelData::tightly_packed(pixels.clone(), 4, PixelFormat::Rgba8Unorm),
            4,
            4,
            PixelFormat::Rgba8Unorm,
            2,
        )?);
        let batch = engine.execute()?;
        assert_eq!(batch.fence_value(), round as u64 + 1);
        finish(&mut engine, batch)?;
        let image = engine
            .resource(key)
            .and_then(StreamableResource::image)
            .expect("loaded resource owns its image");
        assert_eq!(image.read_texels(), pixels);

        engine.start_unload(key, 2)?;
        engine.end_unload(key);
        assert!(engine.device().view(2).is_none());
    }
    assert_eq!(engine.device().stats().live_images, 0);
    assert_eq!(engine.device().stats().live_staging_buffers, 0);
    Ok(())
}
