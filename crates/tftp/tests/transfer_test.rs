//! End-to-end transfers over the loopback interface.
//!
//! These tests run the real server on an ephemeral port and drive it with
//! the library client, or with a bare socket when the peer has to misbehave.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::tempdir;
use tftp::{
    Anomaly, ClientConfig, Direction, ErrorCode, EventSink, Mode, OptionKey, OptionSet, Packet, PacketEvent,
    PacketSummary, ServerConfig, TftpServer, TransferError,
};
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Collects every event a transfer produced, for asserting on the traffic.
#[derive(Default)]
struct Recording {
    events: Mutex<Vec<PacketEvent>>,
}

impl Recording {
    fn received_data_sizes(&self) -> Vec<usize> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.direction == Direction::Receive)
            .filter_map(|e| match &e.packet {
                PacketSummary::Data { size, .. } => Some(*size),
                _ => None,
            })
            .collect()
    }

    fn received_oack_options(&self) -> Option<OptionSet> {
        self.events.lock().unwrap().iter().find_map(|e| match &e.packet {
            PacketSummary::Oack { options } if e.direction == Direction::Receive => Some(options.clone()),
            _ => None,
        })
    }
}

impl EventSink for Recording {
    fn packet(&self, event: &PacketEvent) {
        self.events.lock().unwrap().push(event.clone());
    }

    fn anomaly(&self, _peer: SocketAddr, _anomaly: &Anomaly) {}
}

async fn start_server(root: &Path) -> SocketAddr {
    let mut server = TftpServer::new(ServerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        root_dir: root.to_path_buf(),
    });
    server.bind().await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move { server.run().await });
    addr
}

#[tokio::test]
async fn download_without_options_runs_on_defaults() {
    let root = tempdir().unwrap();
    let content: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(root.path().join("payload.bin"), &content).unwrap();

    let server = start_server(root.path()).await;

    let recording = Arc::new(Recording::default());
    let config = ClientConfig {
        sink: recording.clone(),
        ..Default::default()
    };
    let local = tempdir().unwrap();
    let dest = local.path().join("payload.bin");

    tftp::download(server, "payload.bin", &dest, &config).await.unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), content);
    // 1024 bytes at the default block size: two full blocks and an empty one
    assert_eq!(recording.received_data_sizes(), vec![512, 512, 0]);
}

#[tokio::test]
async fn download_negotiates_blksize_and_tsize() {
    let root = tempdir().unwrap();
    let content = vec![0x5au8; 2048];
    std::fs::write(root.path().join("large.bin"), &content).unwrap();

    let server = start_server(root.path()).await;

    let recording = Arc::new(Recording::default());
    let mut options = OptionSet::new();
    options.set(OptionKey::BlockSize, 1024).set(OptionKey::TransferSize, 0);
    let config = ClientConfig {
        options,
        sink: recording.clone(),
        ..Default::default()
    };
    let local = tempdir().unwrap();
    let dest = local.path().join("large.bin");

    tftp::download(server, "large.bin", &dest, &config).await.unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), content);

    // the OACK answered both options, the tsize probe with the file size
    let oack = recording.received_oack_options().expect("no OACK seen");
    assert_eq!(oack.get(OptionKey::BlockSize), Some(1024));
    assert_eq!(oack.get(OptionKey::TransferSize), Some(2048));

    // every DATA except the last carries exactly the negotiated block size
    assert_eq!(recording.received_data_sizes(), vec![1024, 1024, 0]);
}

#[tokio::test]
async fn upload_stores_the_stream_under_the_remote_name() {
    let root = tempdir().unwrap();
    let server = start_server(root.path()).await;

    let content: Vec<u8> = (0..1500u32).map(|i| (i % 13) as u8).collect();
    let config = ClientConfig::default();
    tftp::upload(server, "incoming.bin", &mut content.as_slice(), &config)
        .await
        .unwrap();

    assert_eq!(std::fs::read(root.path().join("incoming.bin")).unwrap(), content);
}

#[tokio::test]
async fn upload_announces_its_size_when_asked_to() {
    let root = tempdir().unwrap();
    let server = start_server(root.path()).await;

    let content = vec![1u8; 700];
    let mut options = OptionSet::new();
    options.set(OptionKey::BlockSize, 256).set(OptionKey::TransferSize, 0);
    let recording = Arc::new(Recording::default());
    let config = ClientConfig {
        options,
        sink: recording.clone(),
        ..Default::default()
    };

    tftp::upload(server, "sized.bin", &mut content.as_slice(), &config)
        .await
        .unwrap();

    assert_eq!(std::fs::read(root.path().join("sized.bin")).unwrap(), content);

    // the server echoed the announced size, not a zero
    let oack = recording.received_oack_options().expect("no OACK seen");
    assert_eq!(oack.get(OptionKey::TransferSize), Some(700));
    assert_eq!(oack.get(OptionKey::BlockSize), Some(256));
}

#[tokio::test]
async fn netascii_transfer_round_trips_mixed_line_endings() {
    let root = tempdir().unwrap();
    let content = b"unix\nline\ndos\r\nlone cr\rend\n".to_vec();
    std::fs::write(root.path().join("notes.txt"), &content).unwrap();

    let server = start_server(root.path()).await;

    let config = ClientConfig {
        mode: Mode::Netascii,
        ..Default::default()
    };
    let local = tempdir().unwrap();
    let dest = local.path().join("notes.txt");
    tftp::download(server, "notes.txt", &dest, &config).await.unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), content);

    // and back up again
    tftp::upload(server, "notes-copy.txt", &mut content.as_slice(), &config)
        .await
        .unwrap();
    assert_eq!(std::fs::read(root.path().join("notes-copy.txt")).unwrap(), content);
}

#[tokio::test]
async fn missing_file_is_answered_with_error_1() {
    let root = tempdir().unwrap();
    let server = start_server(root.path()).await;

    let local = tempdir().unwrap();
    let dest = local.path().join("ghost.bin");
    let result = tftp::download(server, "ghost.bin", &dest, &ClientConfig::default()).await;

    match result {
        Err(TransferError::Peer { code, .. }) => assert_eq!(code, ErrorCode::FileNotFound.as_u16()),
        other => panic!("expected a peer error, got {:?}", other),
    }
    assert!(!dest.exists());
}

#[tokio::test]
async fn existing_upload_target_is_answered_with_error_6() {
    let root = tempdir().unwrap();
    std::fs::write(root.path().join("taken.bin"), b"already here").unwrap();
    let server = start_server(root.path()).await;

    let result = tftp::upload(server, "taken.bin", &mut b"new".as_slice(), &ClientConfig::default()).await;

    match result {
        Err(TransferError::Peer { code, .. }) => assert_eq!(code, ErrorCode::FileAlreadyExists.as_u16()),
        other => panic!("expected a peer error, got {:?}", other),
    }
    // the original survives untouched
    assert_eq!(std::fs::read(root.path().join("taken.bin")).unwrap(), b"already here");
}

#[tokio::test]
async fn undersized_blksize_offer_is_rejected_with_error_8() {
    let root = tempdir().unwrap();
    std::fs::write(root.path().join("file.bin"), b"content").unwrap();
    let server = start_server(root.path()).await;

    let mut options = OptionSet::new();
    options.set(OptionKey::BlockSize, 4); // below the protocol minimum
    let config = ClientConfig {
        options,
        ..Default::default()
    };
    let local = tempdir().unwrap();
    let dest = local.path().join("file.bin");
    let result = tftp::download(server, "file.bin", &dest, &config).await;

    match result {
        Err(TransferError::Peer { code, .. }) => {
            assert_eq!(code, ErrorCode::OptionNegotiationFailed.as_u16());
        }
        other => panic!("expected a peer error, got {:?}", other),
    }
    assert!(!dest.exists());
}

#[tokio::test]
async fn aborted_download_leaves_no_partial_file() {
    // a hand-driven server that sends one full block and then gives up
    let fake_server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = fake_server.local_addr().unwrap();

    let driver = tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        let (_, client) = fake_server.recv_from(&mut buf).await.unwrap();

        let block = vec![7u8; 512];
        let data = Packet::Data {
            block: 1,
            payload: &block,
        };
        fake_server.send_to(&data.encode(), client).await.unwrap();

        // wait for ACK(1), then pull the plug
        let (len, _) = fake_server.recv_from(&mut buf).await.unwrap();
        assert_eq!(Packet::decode(&buf[..len]).unwrap(), Packet::Ack { block: 1 });

        let error = Packet::Error {
            code: ErrorCode::NotDefined.as_u16(),
            message: "disk fell over",
        };
        fake_server.send_to(&error.encode(), client).await.unwrap();
    });

    let local = tempdir().unwrap();
    let dest = local.path().join("halfway.bin");
    let result = tftp::download(server_addr, "halfway.bin", &dest, &ClientConfig::default()).await;

    assert!(matches!(result, Err(TransferError::Peer { .. })));
    assert!(!dest.exists(), "partial download was left behind");
    driver.await.unwrap();
}

#[tokio::test]
async fn tsize_probe_larger_than_free_space_aborts_with_disk_full() {
    let fake_server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = fake_server.local_addr().unwrap();

    let driver = tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        let (_, client) = fake_server.recv_from(&mut buf).await.unwrap();

        // claim a size no filesystem can hold
        let mut options = OptionSet::new();
        options.set(OptionKey::TransferSize, u64::MAX).set(OptionKey::Timeout, 1);
        fake_server
            .send_to(&Packet::Oack { options }.encode(), client)
            .await
            .unwrap();

        // the client walks away with ERROR 3
        let (len, _) = fake_server.recv_from(&mut buf).await.unwrap();
        let Packet::Error { code, .. } = Packet::decode(&buf[..len]).unwrap() else {
            panic!("expected ERROR 3 from the client");
        };
        assert_eq!(code, ErrorCode::DiskFull.as_u16());
    });

    let mut options = OptionSet::new();
    options.set(OptionKey::TransferSize, 0).set(OptionKey::Timeout, 1);
    let config = ClientConfig {
        options,
        ..Default::default()
    };
    let local = tempdir().unwrap();
    let dest = local.path().join("too-big.bin");
    let result = tftp::download(server_addr, "too-big.bin", &dest, &config).await;

    assert!(matches!(result, Err(TransferError::DiskFull(_))));
    assert!(!dest.exists());
    driver.await.unwrap();
}

#[tokio::test]
async fn request_socket_ignores_non_initial_packets() {
    let root = tempdir().unwrap();
    std::fs::write(root.path().join("file.bin"), b"payload").unwrap();
    let server = start_server(root.path()).await;

    // stray traffic on the well-known port must not break the dispatcher
    let stray = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    stray.send_to(&Packet::Ack { block: 3 }.encode(), server).await.unwrap();
    stray
        .send_to(&Packet::Data { block: 1, payload: b"x" }.encode(), server)
        .await
        .unwrap();
    stray.send_to(b"\xff\xff garbage", server).await.unwrap();

    // nothing comes back on the main socket for those
    let mut buf = [0u8; 64];
    assert!(
        timeout(Duration::from_millis(200), stray.recv_from(&mut buf))
            .await
            .is_err()
    );

    // and a real request still goes through
    let local = tempdir().unwrap();
    let dest = local.path().join("file.bin");
    tftp::download(server, "file.bin", &dest, &ClientConfig::default())
        .await
        .unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
}
