//! Scenario-style integration tests exercising the framing round trip and
//! the tag-dispatch decoder over a real loopback `TcpStream` pair.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use deskstream::protocol::WireMessage;
use deskstream::transport::Transport;
use serde_json::Value;

fn loopback_pair() -> (Transport, Transport) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        Transport::from_stream(stream)
    });

    let client = Transport::connect("127.0.0.1", port).unwrap();
    let server = accepted.join().unwrap().unwrap();
    (client, server)
}

#[test]
fn a_finite_sequence_of_payloads_arrives_intact_and_in_order() {
    let (sender, receiver) = loopback_pair();
    let (tx, rx) = mpsc::channel();
    let _handle = receiver.spawn_receive_worker(move |payload| {
        let _ = tx.send(payload);
    });

    let payloads: Vec<Vec<u8>> = vec![
        b"".to_vec(),
        b"short".to_vec(),
        vec![7u8; 4096],
        WireMessage::encode_no_change(),
    ];
    for payload in &payloads {
        sender.send(payload.clone()).unwrap();
    }

    for expected in &payloads {
        let received = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(&received, expected);
    }
}

#[test]
fn tagged_messages_round_trip_through_a_live_connection() {
    let (sender, receiver) = loopback_pair();
    let (tx, rx) = mpsc::channel();
    let _handle = receiver.spawn_receive_worker(move |payload| {
        let decoded = WireMessage::decode(&payload);
        let _ = tx.send(decoded);
    });

    let set_var = WireMessage::encode_set_var("fps", Value::from(30)).unwrap();
    sender.send(set_var).unwrap();

    match rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap() {
        WireMessage::SetVar(set_var) => {
            assert_eq!(set_var.variable, "fps");
            assert_eq!(set_var.value, Value::from(30));
        }
        other => panic!("unexpected decode: {:?}", other),
    }
}

#[test]
fn an_unknown_configuration_key_is_applied_without_crashing_the_connection() {
    let (sender, receiver) = loopback_pair();
    let (tx, rx) = mpsc::channel();
    let _handle = receiver.spawn_receive_worker(move |payload| {
        let _ = tx.send(WireMessage::decode(&payload));
    });

    let odd_key = WireMessage::encode_set_var("totally_unrecognized_key", Value::from("z")).unwrap();
    sender.send(odd_key).unwrap();
    let follow_up = WireMessage::encode_no_change();
    sender.send(follow_up).unwrap();

    match rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap() {
        WireMessage::SetVar(set_var) => assert_eq!(set_var.variable, "totally_unrecognized_key"),
        other => panic!("unexpected decode: {:?}", other),
    }
    match rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap() {
        WireMessage::NoChange => {}
        other => panic!("unexpected decode: {:?}", other),
    }
}
