//! Sleep/wakeup protocol: a reactor blocked in its poller must observe a
//! peer's message without any I/O traffic.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use io_reactor::{Event, Mesh, Reactor};

#[test]
fn sleeping_reactor_is_woken_by_peer_message() {
    let mesh = Arc::new(Mesh::<u64>::new(2).unwrap());

    let consumer = {
        let mesh = mesh.clone();
        thread::spawn(move || {
            let mut reactor = Reactor::new(1, mesh).unwrap();
            loop {
                reactor.poll().unwrap();
                for event in reactor.drain_events() {
                    if let Event::Message(value) = event {
                        return value;
                    }
                }
            }
        })
    };

    // give the consumer time to fall asleep in its poller
    thread::sleep(Duration::from_millis(50));

    let mut producer = Reactor::new(0, mesh).unwrap();
    assert!(producer.send_msg(1, 42));
    producer.flush_wakeups().unwrap();

    assert_eq!(consumer.join().unwrap(), 42);
}

#[test]
fn message_burst_is_delivered_in_order() {
    const COUNT: u64 = 1000;
    let mesh = Arc::new(Mesh::<u64>::new(2).unwrap());

    let consumer = {
        let mesh = mesh.clone();
        thread::spawn(move || {
            let mut reactor = Reactor::new(1, mesh).unwrap();
            let mut got = Vec::new();
            while (got.len() as u64) < COUNT {
                reactor.poll().unwrap();
                for event in reactor.drain_events() {
                    if let Event::Message(value) = event {
                        got.push(value);
                    }
                }
            }
            got
        })
    };

    let mut producer = Reactor::new(0, mesh).unwrap();
    for i in 0..COUNT {
        while !producer.send_msg(1, i) {
            // queue full: flush the wakeup so the consumer drains
            producer.flush_wakeups().unwrap();
            thread::yield_now();
        }
    }
    producer.flush_wakeups().unwrap();

    let got = consumer.join().unwrap();
    assert_eq!(got, (0..COUNT).collect::<Vec<_>>());
}
