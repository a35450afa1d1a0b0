mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use veilroute_core::{CircuitState, CoreError, CoreResult, OnionRouter, SharedCircuit};
use veilroute_crypto::{random_bytes, respond, HandshakeRequest, LayerCipher};
use veilroute_network::{Frame, FrameDecoder, FrameKind};

use common::*;

/// How a scripted relay answers RELAY cells once the handshake is done
#[derive(Clone, Copy)]
enum Answer {
    /// Random bytes that fail authentication
    Noise,
    /// A correctly sealed cell holding no valid relay message
    Unreadable,
    /// DESTROY for the circuit
    Destroy,
}

/// Single-link relay that completes handshakes honestly, then misbehaves
async fn spawn_scripted_relay(answer: Answer) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; 4096];
        let mut backward: Option<LayerCipher> = None;

        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            decoder.extend(&buf[..n]);

            while let Ok(Some(frame)) = decoder.next_frame() {
                let reply = match frame.kind {
                    FrameKind::Create => {
                        let request = HandshakeRequest::from_bytes(&frame.payload).unwrap();
                        let (reply, keys) = respond(&request).unwrap();
                        backward = Some(keys.into_ciphers().1);
                        Frame::new(FrameKind::Created, frame.circuit_id, reply.to_bytes())
                    }
                    FrameKind::RelayForward => match answer {
                        Answer::Noise => Frame::new(
                            FrameKind::RelayBackward,
                            frame.circuit_id,
                            random_bytes(frame.payload.len()),
                        ),
                        Answer::Unreadable => {
                            let cipher = backward.as_mut().unwrap();
                            let cell = cipher.seal(&[0xFF, 0x00, 0x01]).unwrap();
                            Frame::new(FrameKind::RelayBackward, frame.circuit_id, cell)
                        }
                        Answer::Destroy => Frame::destroy(frame.circuit_id),
                    },
                    _ => continue,
                };
                if stream.write_all(&reply.encode().unwrap()).await.is_err() {
                    return;
                }
            }
        }
    });

    addr
}

/// Single-hop circuit through `relay`, with one message sent and the
/// answer read back
async fn exchange_through(relay: SocketAddr) -> (Arc<OnionRouter>, SharedCircuit, CoreResult<Bytes>) {
    let router = start_router(router_config(vec![relay_id(relay)])).await;
    let shared = router.create_circuit(1).await.unwrap();
    let result = {
        let mut circuit = shared.lock().await;
        assert_eq!(circuit.state(), CircuitState::Established);
        circuit.send_data(b"hello").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), circuit.receive_data())
            .await
            .expect("receive_data did not return")
    };
    (router, shared, result)
}

/// Relay that accepts links and never says anything
async fn spawn_silent_relay() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    addr
}

#[tokio::test]
async fn test_unreachable_relay_is_routed_around() {
    let relays = spawn_relays(4).await;
    let dead = format!("127.0.0.1:{}", dead_port());
    let mut trusted = relay_ids(&relays);
    trusted.push(dead.clone());

    let router = start_router(router_config(trusted)).await;
    assert_eq!(router.directory().trusted_count(), 5);

    // With 3 of 5 picked per circuit the dead relay comes up quickly
    for _ in 0..8 {
        let shared = router.create_circuit(3).await.unwrap();
        let circuit = shared.lock().await;
        assert_eq!(circuit.state(), CircuitState::Established);
        assert!(!circuit.node_ids().contains(&dead));
    }
    assert_eq!(router.manager().active_count(), 8);

    stop_all(&router, &relays).await;
}

#[tokio::test]
async fn test_only_dead_relays_exhaust_retries() {
    let trusted: Vec<String> = (0..4)
        .map(|_| format!("127.0.0.1:{}", dead_port()))
        .collect();
    let router = start_router(router_config(trusted)).await;

    // Three attempts at the first hop with the default of two retries
    assert!(matches!(
        router.create_circuit(1).await,
        Err(CoreError::ExtendError(_))
    ));
    assert_eq!(router.manager().active_count(), 0);
    assert_eq!(router.manager().available_capacity(), 100);

    router.stop().await;
}

#[tokio::test]
async fn test_not_enough_relays() {
    let relays = spawn_relays(2).await;
    let router = start_router(router_config(relay_ids(&relays))).await;

    assert!(matches!(
        router.create_circuit(3).await,
        Err(CoreError::NoPathAvailable)
    ));
    assert_eq!(router.transport().connection_count(), 0);

    stop_all(&router, &relays).await;
}

#[tokio::test]
async fn test_stop_during_extend_reports_shutdown() {
    let silent = spawn_silent_relay().await;
    let mut config = router_config(vec![format!("127.0.0.1:{}", silent.port())]);
    config.extend_timeout = Duration::from_secs(30);
    let router: Arc<OnionRouter> = start_router(config).await;

    let building = {
        let router = router.clone();
        tokio::spawn(async move { router.create_circuit(1).await })
    };

    // Let the CREATE go out and the circuit start waiting
    tokio::time::sleep(Duration::from_millis(200)).await;
    router.stop().await;

    let result = tokio::time::timeout(Duration::from_secs(5), building)
        .await
        .expect("extend did not observe shutdown")
        .unwrap();
    assert!(matches!(result, Err(CoreError::TransportShutdown)));
    assert_eq!(router.manager().active_count(), 0);
}

#[tokio::test]
async fn test_tampered_backward_cell_fails_circuit() {
    let fake = spawn_scripted_relay(Answer::Noise).await;
    let (router, shared, result) = exchange_through(fake).await;
    assert!(matches!(result, Err(CoreError::AuthFailure)));

    let id = {
        let mut circuit = shared.lock().await;
        assert_eq!(circuit.state(), CircuitState::Failed);
        assert!(matches!(
            circuit.send_data(b"again").await,
            Err(CoreError::NotEstablished)
        ));
        circuit.id()
    };

    // Failed circuits are dropped on the next sweep
    assert_eq!(router.manager().sweep_idle(), 1);
    assert!(router.manager().circuit(id).is_none());

    router.stop().await;
}

#[tokio::test]
async fn test_unreadable_relay_message_fails_circuit() {
    let fake = spawn_scripted_relay(Answer::Unreadable).await;
    let (router, shared, result) = exchange_through(fake).await;

    assert!(matches!(result, Err(CoreError::Network(_))));
    assert_eq!(shared.lock().await.state(), CircuitState::Failed);

    router.stop().await;
}

#[tokio::test]
async fn test_relay_destroy_fails_circuit() {
    let fake = spawn_scripted_relay(Answer::Destroy).await;
    let (router, shared, result) = exchange_through(fake).await;

    assert!(matches!(result, Err(CoreError::ProtocolError(_))));
    let circuit = shared.lock().await;
    assert_eq!(circuit.state(), CircuitState::Failed);
    assert!(circuit.link().is_none());
    drop(circuit);

    router.stop().await;
}

#[tokio::test]
async fn test_guard_going_away_fails_circuit() {
    let relays = spawn_relays(3).await;
    let router = start_router(router_config(relay_ids(&relays))).await;

    let shared = router.create_circuit(3).await.unwrap();
    let mut circuit = shared.lock().await;
    let guard = relays
        .iter()
        .find(|r| relay_id(r.local_addr().unwrap()) == circuit.node_ids()[0])
        .unwrap();
    guard.stop().await;

    let result = tokio::time::timeout(Duration::from_secs(5), circuit.receive_data())
        .await
        .expect("receive_data did not notice the lost link");
    assert!(matches!(result, Err(CoreError::ProtocolError(_))));
    assert_eq!(circuit.state(), CircuitState::Failed);
    drop(circuit);

    wait_until(|| router.transport().connection_count() == 0).await;
    stop_all(&router, &relays).await;
}

#[tokio::test]
async fn test_local_disconnect_fails_circuit() {
    let relays = spawn_relays(3).await;
    let router = start_router(router_config(relay_ids(&relays))).await;

    let shared = router.create_circuit(3).await.unwrap();
    let mut circuit = shared.lock().await;
    let guard = circuit.node_ids()[0].clone();
    assert!(router.directory().disconnect(&guard));

    let result = tokio::time::timeout(Duration::from_secs(3), circuit.receive_data())
        .await
        .expect("receive_data did not notice the closed link");
    assert!(matches!(result, Err(CoreError::ProtocolError(_))));
    assert_eq!(circuit.state(), CircuitState::Failed);
    drop(circuit);

    // The relays see the link close and tear their halves down
    wait_until(|| relays.iter().all(|r| r.circuit_count() == 0)).await;
    stop_all(&router, &relays).await;
}

#[tokio::test]
async fn test_capacity_limit() {
    let relays = spawn_relays(3).await;
    let mut config = router_config(relay_ids(&relays));
    config.max_circuits = 2;
    let router = start_router(config).await;

    let first = router.create_circuit(1).await.unwrap();
    let _second = router.create_circuit(1).await.unwrap();
    assert!(matches!(
        router.create_circuit(1).await,
        Err(CoreError::CapacityError { max: 2 })
    ));

    let id = first.lock().await.id();
    router.manager().destroy_circuit(id).await.unwrap();
    router.create_circuit(1).await.unwrap();
    assert_eq!(router.manager().active_count(), 2);

    stop_all(&router, &relays).await;
}
