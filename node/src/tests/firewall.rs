use crate::chain::local::{LocalChain, LocalChainConfig};
use crate::chain::operator_id_of;
use crate::firewall::Firewall;
use crate::network::tcp::{new_tcp_mesh_network, PeerAdmission, TcpMeshSender};
use crate::network::{MeshNetworkTransportReceiver, MeshNetworkTransportSender};
use crate::primitives::{MpcMessage, MpcTaskId};
use k256::ecdsa::SigningKey;
use keep_primitives::OperatorId;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

struct Peer {
    key: SigningKey,
    operator: OperatorId,
}

fn peer() -> Peer {
    let key = SigningKey::random(&mut rand::thread_rng());
    let operator = operator_id_of(key.verifying_key().as_affine());
    Peer { key, operator }
}

fn firewall_over(chain: &Arc<LocalChain>, operator: OperatorId) -> Arc<Firewall> {
    let client = Arc::new(chain.client(operator));
    Arc::new(Firewall::new(client.clone(), client))
}

async fn wait_connected(sender: &TcpMeshSender, peer: OperatorId) -> bool {
    for _ in 0..200 {
        if sender.connected_peers().contains(&peer) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

// A peer without stake that is a member of an active keep gets through, and
// its membership is cached.
#[tokio::test]
async fn test_firewall_admits_active_keep_member_without_stake() {
    let chain = LocalChain::new(LocalChainConfig::default());
    let staked = peer();
    let member = peer();
    let stranger = peer();
    chain.set_stake(staked.operator, 1_000);
    let keep = chain
        .open_keep(
            OperatorId::from([0xee; 20]),
            vec![staked.operator, member.operator],
            2,
            "app",
        )
        .unwrap();

    let staked_firewall = firewall_over(&chain, staked.operator);
    let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let (_staked_sender, mut staked_receiver, staked_addr) = new_tcp_mesh_network(
        local,
        &[],
        &staked.key,
        staked_firewall.clone() as Arc<dyn PeerAdmission>,
    )
    .await
    .unwrap();

    let (member_sender, _member_receiver, _) = new_tcp_mesh_network(
        local,
        &[staked_addr.to_string()],
        &member.key,
        firewall_over(&chain, member.operator),
    )
    .await
    .unwrap();
    assert!(wait_connected(&member_sender, staked.operator).await);
    let message = MpcMessage {
        task_id: MpcTaskId::KeyGeneration {
            keep: keep.clone(),
        },
        data: b"hello".to_vec(),
    };
    member_sender
        .send(staked.operator, message.clone())
        .await
        .unwrap();
    let received = staked_receiver.receive().await.unwrap();
    assert_eq!(received.from, member.operator);
    assert_eq!(received.message, message);
    assert!(staked_firewall.is_cached(&member.operator));

    let (_stranger_sender, _stranger_receiver, _) = new_tcp_mesh_network(
        local,
        &[staked_addr.to_string()],
        &stranger.key,
        firewall_over(&chain, stranger.operator),
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!staked_firewall.is_cached(&stranger.operator));
    assert!(!staked_firewall
        .is_recognized(&stranger.operator)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_closed_keep_membership_is_not_enough() {
    let chain = LocalChain::new(LocalChainConfig::default());
    let member = peer();
    let keep = chain
        .open_keep(OperatorId::from([0xee; 20]), vec![member.operator], 1, "app")
        .unwrap();
    chain.close_keep(&keep).unwrap();
    let firewall = firewall_over(&chain, OperatorId::from([1; 20]));
    assert!(!firewall.is_recognized(&member.operator).await.unwrap());
    assert!(!firewall.is_cached(&member.operator));
}
