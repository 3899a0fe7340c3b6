//! Client and server transfer threads connected back to back, with a lossy link in between

use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::Level;
use windowed_transfer::chunk::ProtocolVersion;
use windowed_transfer::test_util::memory::{MemoryReader, MemoryResource, MemoryWriter};
use windowed_transfer::test_util::recording::{RecordingChunkWriter, SentChunks};
use windowed_transfer::*;

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

/// Decides by sequence number (starting at 1) whether the link loses a chunk
type LossPattern = fn(usize) -> bool;

fn lossless(_: usize) -> bool {
    false
}

fn forward(mut sent: SentChunks, to: TransferThreadHandle, stream: TransferStream, is_lost: LossPattern) {
    tokio::spawn(async move {
        let mut sequence_number = 0;
        while let Some(chunk) = sent.next_raw().await {
            sequence_number += 1;
            if is_lost(sequence_number) {
                continue;
            }
            if to.process_chunk(stream, chunk).await.is_err() {
                break;
            }
        }
    });
}

async fn connect(config: TransferConfig, to_server: LossPattern, to_client: LossPattern) -> (TransferClient, TransferService) {
    let (client_thread, client_runner) = TransferThread::new(config.clone()).unwrap();
    let (server_thread, server_runner) = TransferThread::new(config).unwrap();
    tokio::spawn(client_runner.run());
    tokio::spawn(server_runner.run());

    for (client_stream, server_stream) in [(TransferStream::ClientRead, TransferStream::ServerRead), (TransferStream::ClientWrite, TransferStream::ServerWrite)] {
        let (writer, sent) = RecordingChunkWriter::new();
        client_thread.set_stream(client_stream, Arc::new(writer)).await.unwrap();
        forward(sent, server_thread.clone(), server_stream, to_server);

        let (writer, sent) = RecordingChunkWriter::new();
        server_thread.set_stream(server_stream, Arc::new(writer)).await.unwrap();
        forward(sent, client_thread.clone(), client_stream, to_client);
    }

    (TransferClient::new(client_thread), TransferService::new(server_thread))
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

fn on_completion() -> (impl FnOnce(Status) + Send + 'static, oneshot::Receiver<Status>) {
    let (send, recv) = oneshot::channel();
    (move |status| { let _ = send.send(status); }, recv)
}

fn small_chunks() -> TransferConfig {
    TransferConfig {
        max_chunk_size_bytes: 128,
        max_window_size_bytes: 1024,
        encode_buffer_size: 128 + 64,
        ..TransferConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_read() {
    let (client, service) = connect(small_chunks(), lossless, lossless).await;
    let resource = MemoryResource::new(payload(10_000));
    service.register_handler(Handler::read_only(1, resource.clone())).await.unwrap();

    let writer = MemoryWriter::new();
    let (callback, completed) = on_completion();
    client.read(1, writer.clone(), TransferOptions::default(), callback).await.unwrap();

    assert_eq!(completed.await.unwrap(), Status::Ok);
    assert_eq!(writer.contents(), payload(10_000));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(resource.finalized(), vec![Status::Ok]);
}

#[tokio::test(start_paused = true)]
async fn test_write_over_lossy_link() {
    let (client, service) = connect(small_chunks(), |n| n % 7 == 0, |n| n % 5 == 0).await;
    let resource = MemoryResource::new(vec![]);
    service.register_handler(Handler::write_only(2, resource.clone())).await.unwrap();

    let (callback, completed) = on_completion();
    client.write(2, MemoryReader::new(payload(10_000)), TransferOptions::default(), callback).await.unwrap();

    assert_eq!(completed.await.unwrap(), Status::Ok);
    assert_eq!(resource.contents(), payload(10_000));
}

#[tokio::test(start_paused = true)]
async fn test_read_over_lossy_link() {
    let (client, service) = connect(small_chunks(), |n| n % 6 == 0, |n| n % 9 == 0).await;
    service.register_handler(Handler::read_only(3, MemoryResource::new(payload(5_000)))).await.unwrap();

    let writer = MemoryWriter::new();
    let (callback, completed) = on_completion();
    client.read(3, writer.clone(), TransferOptions::default(), callback).await.unwrap();

    assert_eq!(completed.await.unwrap(), Status::Ok);
    assert_eq!(writer.contents(), payload(5_000));
}

#[tokio::test(start_paused = true)]
async fn test_resumed_write() {
    let (client, service) = connect(small_chunks(), lossless, lossless).await;
    let resource = MemoryResource::new(payload(3_000));
    service.register_handler(Handler::write_only(4, resource.clone())).await.unwrap();

    let mut rest = MemoryReader::new(payload(5_000));
    windowed_transfer::handler::TransferReader::seek(&mut rest, 2_000).unwrap();

    let (callback, completed) = on_completion();
    client.write(4, rest, TransferOptions::default().with_initial_offset(2_000), callback).await.unwrap();

    assert_eq!(completed.await.unwrap(), Status::Ok);
    assert_eq!(resource.contents(), payload(5_000));
}

#[tokio::test(start_paused = true)]
async fn test_legacy_client() {
    let (client, service) = connect(small_chunks(), lossless, lossless).await;
    service.register_handler(Handler::read_write(5, MemoryResource::new(payload(2_000)))).await.unwrap();

    let legacy = TransferOptions::default().with_protocol_version(ProtocolVersion::Legacy);

    let writer = MemoryWriter::new();
    let (callback, completed) = on_completion();
    client.read(5, writer.clone(), legacy.clone(), callback).await.unwrap();
    assert_eq!(completed.await.unwrap(), Status::Ok);
    assert_eq!(writer.contents(), payload(2_000));

    let (callback, completed) = on_completion();
    client.write(5, MemoryReader::new(payload(700)), legacy, callback).await.unwrap();
    assert_eq!(completed.await.unwrap(), Status::Ok);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_resource() {
    let (client, _service) = connect(small_chunks(), lossless, lossless).await;

    let (callback, completed) = on_completion();
    client.read(99, MemoryWriter::new(), TransferOptions::default(), callback).await.unwrap();
    assert_eq!(completed.await.unwrap(), Status::NotFound);
}

#[tokio::test(start_paused = true)]
async fn test_server_unreachable() {
    let (client, _service) = connect(small_chunks(), |_| true, lossless).await;

    let (callback, completed) = on_completion();
    client.write(1, MemoryReader::new(payload(10)), TransferOptions::default(), callback).await.unwrap();
    assert_eq!(completed.await.unwrap(), Status::DeadlineExceeded);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_transfers() {
    let (client, service) = connect(small_chunks(), |n| n % 11 == 0, lossless).await;
    for resource_id in 10..14 {
        service.register_handler(Handler::read_only(resource_id, MemoryResource::new(payload(resource_id as usize * 100)))).await.unwrap();
    }

    let mut transfers = Vec::new();
    for resource_id in 10..14 {
        let writer = MemoryWriter::new();
        let (callback, completed) = on_completion();
        client.read(resource_id, writer.clone(), TransferOptions::default(), callback).await.unwrap();
        transfers.push((resource_id, writer, completed));
    }

    for (resource_id, writer, completed) in transfers {
        assert_eq!(completed.await.unwrap(), Status::Ok);
        assert_eq!(writer.contents(), payload(resource_id as usize * 100));
    }
}
