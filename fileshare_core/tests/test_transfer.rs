use fileshare_core::transfer::constants::{DEFAULT_MAX_FRAME_SIZE, INCOMING_DIR, MAX_CHUNK_SIZE};
use fileshare_core::transfer::message::{Chunk, FileMetadata, Message};
use fileshare_core::transfer::protocol::{Decoded, recv_msg, send_msg};
use fileshare_core::{
    ClientConfig, FileClient, FileServer, ServerConfig, ServerHandle, TransferError, TransferEvent,
    TransferHooks,
};
use rand::RngCore;
use std::net::SocketAddr;
use std::path::Path;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

async fn start_server(storage: &Path) -> (SocketAddr, ServerHandle) {
    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        storage_dir: storage.to_path_buf(),
        ..ServerConfig::default()
    };
    let server = FileServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.handle();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    (addr, handle)
}

async fn connect(addr: SocketAddr, download_dir: &Path) -> FileClient {
    let config = ClientConfig {
        download_dir: download_dir.to_path_buf(),
        ..ClientConfig::default()
    };
    FileClient::connect(&addr.to_string(), config).await.unwrap()
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::rng().fill_bytes(&mut data);
    data
}

#[tokio::test]
async fn test_list_after_upload() {
    let storage = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let (addr, handle) = start_server(storage.path()).await;
    let mut client = connect(addr, downloads.path()).await;

    assert!(client.list_files().await.unwrap().is_empty());

    let outcome = client.upload_bytes("a.txt", vec![b'x'; 1536]).await.unwrap();
    assert_eq!(outcome.message, "File a.txt uploaded successfully");

    let files = client.list_files().await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "a.txt");
    assert_eq!(files[0].size, 1536);
    assert_eq!(files[0].size_formatted, "1.50 KB");

    handle.shutdown();
}

#[tokio::test]
async fn test_download_multi_chunk_file() {
    let storage = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let data = random_bytes(MAX_CHUNK_SIZE * 3 + 12_345);
    tokio::fs::write(storage.path().join("big.bin"), &data).await.unwrap();

    let (addr, handle) = start_server(storage.path()).await;
    let mut client = connect(addr, downloads.path()).await;

    let (event_tx, mut event_rx) = mpsc::channel(1000);
    let hooks = TransferHooks::with_events(event_tx);
    let outcome = client.download_file("big.bin", None, &hooks).await.unwrap();
    drop(hooks);

    assert_eq!(outcome.path, downloads.path().join("big.bin"));
    assert_eq!(outcome.bytes, data.len() as u64);
    assert_eq!(outcome.chunks, 4);
    assert_eq!(tokio::fs::read(&outcome.path).await.unwrap(), data);
    assert!(!downloads.path().join("big.bin.part").exists());

    let mut progress = Vec::new();
    let mut completed = false;
    while let Some(event) = event_rx.recv().await {
        match event {
            TransferEvent::Progress { chunks_done, total_chunks, .. } => {
                assert_eq!(total_chunks, 4);
                progress.push(chunks_done);
            }
            TransferEvent::Completed { bytes, .. } => {
                assert_eq!(bytes, data.len() as u64);
                completed = true;
            }
            TransferEvent::Error(e) => panic!("unexpected error event: {}", e),
        }
    }
    assert_eq!(progress, vec![1, 2, 3, 4]);
    assert!(completed);

    handle.shutdown();
}

#[tokio::test]
async fn test_download_to_explicit_path() {
    let storage = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    tokio::fs::write(storage.path().join("notes.txt"), b"remember the milk").await.unwrap();

    let (addr, handle) = start_server(storage.path()).await;
    let mut client = connect(addr, downloads.path()).await;

    let dest = downloads.path().join("sub").join("copy.txt");
    let outcome = client
        .download_file("notes.txt", Some(&dest), &TransferHooks::default())
        .await
        .unwrap();
    assert_eq!(outcome.path, dest);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"remember the milk");

    handle.shutdown();
}

#[tokio::test]
async fn test_zero_byte_download() {
    let storage = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    tokio::fs::write(storage.path().join("empty.txt"), b"").await.unwrap();

    let (addr, handle) = start_server(storage.path()).await;
    let mut client = connect(addr, downloads.path()).await;

    let outcome = client
        .download_file("empty.txt", None, &TransferHooks::default())
        .await
        .unwrap();
    assert_eq!(outcome.bytes, 0);
    assert_eq!(outcome.chunks, 0);
    assert_eq!(tokio::fs::read(&outcome.path).await.unwrap().len(), 0);

    // Connection is still in step
    assert_eq!(client.list_files().await.unwrap().len(), 1);

    handle.shutdown();
}

#[tokio::test]
async fn test_missing_file_keeps_connection() {
    let storage = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let (addr, handle) = start_server(storage.path()).await;
    let mut client = connect(addr, downloads.path()).await;

    let err = client
        .download_file("nope.txt", None, &TransferHooks::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::NotFound(ref name) if name == "nope.txt"), "{}", err);
    assert!(client.is_connected());
    assert!(!downloads.path().join("nope.txt").exists());

    assert!(client.list_files().await.unwrap().is_empty());

    handle.shutdown();
}

#[tokio::test]
async fn test_chunked_upload() {
    let storage = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    let data = random_bytes(MAX_CHUNK_SIZE * 2 + 1);
    let path = source.path().join("upload.bin");
    tokio::fs::write(&path, &data).await.unwrap();

    let (addr, handle) = start_server(storage.path()).await;
    let mut client = connect(addr, downloads.path()).await;

    let outcome = client.upload_file(&path, &TransferHooks::default()).await.unwrap();
    assert_eq!(outcome.file_name, "upload.bin");
    assert_eq!(outcome.bytes, data.len() as u64);
    assert_eq!(outcome.message, "File upload.bin uploaded successfully");

    let stored = tokio::fs::read(storage.path().join("upload.bin")).await.unwrap();
    assert_eq!(stored, data);

    let mut staging = tokio::fs::read_dir(storage.path().join(INCOMING_DIR)).await.unwrap();
    assert!(staging.next_entry().await.unwrap().is_none());

    // And back down again over the same connection
    let back = client
        .download_file("upload.bin", None, &TransferHooks::default())
        .await
        .unwrap();
    assert_eq!(tokio::fs::read(&back.path).await.unwrap(), data);

    handle.shutdown();
}

#[tokio::test]
async fn test_upload_replaces_existing_file() {
    let storage = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    tokio::fs::write(storage.path().join("a.txt"), b"old content").await.unwrap();

    let (addr, handle) = start_server(storage.path()).await;
    let mut client = connect(addr, downloads.path()).await;

    client.upload_bytes("a.txt", b"new".to_vec()).await.unwrap();
    assert_eq!(tokio::fs::read(storage.path().join("a.txt")).await.unwrap(), b"new");

    handle.shutdown();
}

#[tokio::test]
async fn test_concurrent_downloads() {
    let storage = tempfile::tempdir().unwrap();
    let first = random_bytes(MAX_CHUNK_SIZE * 4 + 7);
    let second = random_bytes(MAX_CHUNK_SIZE * 2 + 99);
    tokio::fs::write(storage.path().join("one.bin"), &first).await.unwrap();
    tokio::fs::write(storage.path().join("two.bin"), &second).await.unwrap();

    let (addr, handle) = start_server(storage.path()).await;

    let mut tasks = Vec::new();
    for (name, expected) in [("one.bin", first), ("two.bin", second)] {
        tasks.push(tokio::spawn(async move {
            let downloads = tempfile::tempdir().unwrap();
            let mut client = connect(addr, downloads.path()).await;
            let outcome = client
                .download_file(name, None, &TransferHooks::default())
                .await
                .unwrap();
            assert_eq!(tokio::fs::read(&outcome.path).await.unwrap(), expected);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    handle.shutdown();
}

#[tokio::test]
async fn test_cancelled_download_keeps_connection_usable() {
    let storage = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    tokio::fs::write(storage.path().join("big.bin"), random_bytes(MAX_CHUNK_SIZE * 3))
        .await
        .unwrap();

    let (addr, handle) = start_server(storage.path()).await;
    let mut client = connect(addr, downloads.path()).await;

    let hooks = TransferHooks::default();
    hooks.cancel.cancel();
    let err = client.download_file("big.bin", None, &hooks).await.unwrap_err();
    assert!(matches!(err, TransferError::Cancelled), "{}", err);
    assert!(client.is_connected());
    assert!(!downloads.path().join("big.bin").exists());
    assert!(!downloads.path().join("big.bin.part").exists());

    let files = client.list_files().await.unwrap();
    assert_eq!(files.len(), 1);

    handle.shutdown();
}

#[tokio::test]
async fn test_cancelled_upload_leaves_nothing_behind() {
    let storage = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    let path = source.path().join("draft.bin");
    tokio::fs::write(&path, random_bytes(MAX_CHUNK_SIZE + 1)).await.unwrap();

    let (addr, handle) = start_server(storage.path()).await;
    let mut client = connect(addr, downloads.path()).await;

    let hooks = TransferHooks::default();
    hooks.cancel.cancel();
    let err = client.upload_file(&path, &hooks).await.unwrap_err();
    assert!(matches!(err, TransferError::Cancelled), "{}", err);
    assert!(client.is_connected());

    // The server has dropped the staged upload by the time it answers
    assert!(client.list_files().await.unwrap().is_empty());
    let mut staging = tokio::fs::read_dir(storage.path().join(INCOMING_DIR)).await.unwrap();
    assert!(staging.next_entry().await.unwrap().is_none());

    handle.shutdown();
}

#[tokio::test]
async fn test_requests_after_disconnect_fail() {
    let storage = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let (addr, handle) = start_server(storage.path()).await;
    let mut client = connect(addr, downloads.path()).await;

    client.disconnect().await;
    assert!(!client.is_connected());
    assert!(matches!(client.list_files().await, Err(TransferError::NotConnected)));

    handle.shutdown();
}

#[tokio::test]
async fn test_connect_refused() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = FileClient::connect(&addr.to_string(), ClientConfig::default()).await;
    assert!(matches!(result, Err(TransferError::Connect { .. })));
}

/// Accept one connection and hand it to `script`, standing in for a server
async fn scripted_server<F, Fut>(script: F) -> (SocketAddr, JoinHandle<()>)
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        script(stream).await;
    });
    (addr, task)
}

async fn expect_file_request(stream: &mut TcpStream) {
    match recv_msg(stream, DEFAULT_MAX_FRAME_SIZE).await.unwrap() {
        Decoded::Message(Message::FileRequest(_)) => {}
        other => panic!("expected file request, got {}", other.describe()),
    }
}

#[tokio::test]
async fn test_silent_server_times_out_and_drops_connection() {
    let (addr, server) = scripted_server(|mut stream| async move {
        assert_eq!(
            recv_msg(&mut stream, DEFAULT_MAX_FRAME_SIZE).await.unwrap(),
            Decoded::Message(Message::FileListRequest)
        );
        // Never answer; the client hanging up ends the stream
        assert_eq!(
            recv_msg(&mut stream, DEFAULT_MAX_FRAME_SIZE).await.unwrap(),
            Decoded::EndOfStream
        );
    })
    .await;

    let config = ClientConfig {
        read_timeout_secs: 1,
        ..ClientConfig::default()
    };
    let mut client = FileClient::connect(&addr.to_string(), config).await.unwrap();
    let err = client.list_files().await.unwrap_err();
    assert!(matches!(err, TransferError::Timeout(_)), "{}", err);
    assert!(!client.is_connected());

    server.await.unwrap();
}

#[tokio::test]
async fn test_connection_lost_mid_download_removes_partial() {
    let (addr, server) = scripted_server(|mut stream| async move {
        expect_file_request(&mut stream).await;
        let size = MAX_CHUNK_SIZE as u64 * 2;
        send_msg(&mut stream, &Message::FileResponse(FileMetadata::new("big.bin", size)))
            .await
            .unwrap();
        let chunk = Chunk {
            chunk_id: 0,
            total_chunks: 2,
            data: vec![7u8; MAX_CHUNK_SIZE],
        };
        send_msg(&mut stream, &Message::FileChunk(chunk)).await.unwrap();
        match recv_msg(&mut stream, DEFAULT_MAX_FRAME_SIZE).await.unwrap() {
            Decoded::Message(Message::ChunkAck(ack)) => assert_eq!(ack.chunk_id, 0),
            other => panic!("expected ack, got {}", other.describe()),
        }
        // Hang up before the second chunk
    })
    .await;

    let downloads = tempfile::tempdir().unwrap();
    let mut client = connect(addr, downloads.path()).await;
    let err = client
        .download_file("big.bin", None, &TransferHooks::default())
        .await
        .unwrap_err();
    server.await.unwrap();

    assert!(matches!(err, TransferError::ConnectionLost), "{}", err);
    assert!(!client.is_connected());
    assert!(!downloads.path().join("big.bin").exists());
    assert!(!downloads.path().join("big.bin.part").exists());
}

#[tokio::test]
async fn test_server_error_instead_of_chunk_keeps_connection() {
    let (addr, server) = scripted_server(|mut stream| async move {
        expect_file_request(&mut stream).await;
        send_msg(&mut stream, &Message::FileResponse(FileMetadata::new("big.bin", 10)))
            .await
            .unwrap();
        send_msg(&mut stream, &Message::error("disk on fire")).await.unwrap();
        assert_eq!(
            recv_msg(&mut stream, DEFAULT_MAX_FRAME_SIZE).await.unwrap(),
            Decoded::Message(Message::FileListRequest)
        );
    })
    .await;

    let downloads = tempfile::tempdir().unwrap();
    let mut client = connect(addr, downloads.path()).await;
    let err = client
        .download_file("big.bin", None, &TransferHooks::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Remote(ref text) if text == "disk on fire"), "{}", err);
    assert!(client.is_connected());
    assert!(!downloads.path().join("big.bin.part").exists());

    // The request goes out; the scripted server hangs up without answering
    let _ = client.list_files().await;
    server.await.unwrap();
}
