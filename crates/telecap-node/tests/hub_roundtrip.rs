use std::time::Duration;

use tokio_util::sync::CancellationToken;

use telecap_node::hub::run_hub;
use telecap_wire::client::{BridgeClient, SocketPaths};
use telecap_wire::{read_message, write_message, Message, Payload};

fn temp_paths(test_name: &str) -> SocketPaths {
    let mut dir = std::env::temp_dir();
    dir.push(format!(
        "telecap-hub-{}-{}-{}",
        test_name,
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
    ));
    SocketPaths::new(dir)
}

async fn wait_for_sockets(paths: &SocketPaths) {
    for _ in 0..100 {
        if paths.all().iter().all(|p| p.exists()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("hub sockets never appeared under {:?}", paths.runtime_dir);
}

#[tokio::test]
async fn publish_then_get_returns_latest() -> anyhow::Result<()> {
    let paths = temp_paths("get");
    let cancel = CancellationToken::new();
    let hub = tokio::spawn(run_hub(paths.clone(), cancel.clone()));
    wait_for_sockets(&paths).await;

    // A node publishes two values; only the latest survives.
    let mut node = tokio::net::UnixStream::connect(paths.hub()).await?;
    for v in [1.0f32, 2.0] {
        write_message(
            &mut node,
            &Message::Publish {
                topic: "joint/follower".to_string(),
                payload: Payload::Vector {
                    name: "follower".to_string(),
                    values: vec![v; 7],
                },
            },
        )
        .await?;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = BridgeClient::new(paths.clone());
    client.connect().await?;
    let got = client
        .latest_vector("joint/follower", Duration::from_millis(100))
        .await?
        .expect("latest value");
    assert_eq!(got.values, vec![2.0; 7]);

    // A topic nobody published is an Empty reply, not a hang.
    let missing = client
        .latest_vector("joint/leader", Duration::from_millis(100))
        .await?;
    assert!(missing.is_none());

    cancel.cancel();
    let _ = hub.await?;
    Ok(())
}

#[tokio::test]
async fn subscriber_receives_pushed_inputs_and_stop() -> anyhow::Result<()> {
    let paths = temp_paths("sub");
    let cancel = CancellationToken::new();
    let hub = tokio::spawn(run_hub(paths.clone(), cancel.clone()));
    wait_for_sockets(&paths).await;

    let mut subscriber = tokio::net::UnixStream::connect(paths.hub()).await?;
    write_message(
        &mut subscriber,
        &Message::Subscribe {
            topics: vec!["action/command".to_string()],
        },
    )
    .await?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The CLI injects an action via the joints reply socket.
    let mut client = BridgeClient::new(paths.clone());
    client.connect().await?;
    let action = telecap_core::types::JointVector::new("cli", vec![500.0; 6]);
    assert!(client.send_action(&action, Duration::from_millis(200)).await?);

    let pushed = tokio::time::timeout(Duration::from_secs(1), read_message(&mut subscriber)).await??;
    match pushed {
        Message::Data { topic, payload } => {
            assert_eq!(topic, "action/command");
            match payload {
                Payload::Vector { values, .. } => assert_eq!(values, vec![500.0; 6]),
                other => panic!("unexpected payload {other:?}"),
            }
        }
        other => panic!("unexpected message {other:?}"),
    }

    // Cancellation reaches subscribed nodes as a Stop frame.
    cancel.cancel();
    let stop = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match read_message(&mut subscriber).await {
                Ok(Message::Stop) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await?;
    assert!(stop);

    let _ = hub.await?;
    Ok(())
}
