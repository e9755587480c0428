//! A simulated receive path: an "interrupt" thread fills pool blocks with frames and submits
//! them through pre-reserved queue nodes, a consumer thread hands them to a socket handler.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ncp_core::{
    BlockPool, Consumer, Delivery, DestinationId, FlagGroup, NodePool, Packet, Queue, Router,
    Signal, StatusHandler,
};

const SOCKET: DestinationId = DestinationId(3);
const SOCKET_RX: u32 = 0b1;
const FRAMES: u8 = 16;

fn main() -> Result<(), ncp_core::Error> {
    let blocks = BlockPool::builder()
        .name("rx")
        .block_size(128)
        .block_count(4)
        .build()?;
    let nodes = NodePool::<Packet>::new(8)?;
    let flags = Arc::new(FlagGroup::new());

    let router = Router::builder()
        .register_destination(
            SOCKET,
            |delivery: Delivery| {
                let text = String::from_utf8_lossy(delivery.payload()).into_owned();
                println!("socket received {} bytes: {text}", delivery.len());
                delivery.complete();
            },
            Signal::new(flags.clone(), SOCKET_RX),
            Queue::new(&nodes)?,
        )?
        .build();

    let consumer = Consumer::spawn(router.clone(), SOCKET, flags, SOCKET_RX)?;

    let interrupt = thread::spawn({
        let router = router.clone();

        move || -> Result<(), ncp_core::Error> {
            let mut sequence = 0;

            while sequence < FRAMES {
                // A real interrupt handler cannot wait and would drop the frame instead.
                let Ok(mut block) = blocks.alloc() else {
                    thread::sleep(Duration::from_millis(1));
                    continue;
                };

                let frame = format!("frame #{sequence}");
                let len = frame.len();
                block
                    .get_mut(..len)
                    .expect("frames are shorter than a block")
                    .copy_from_slice(frame.as_bytes());

                let mut packet = Packet::new(
                    block,
                    len,
                    StatusHandler::from_fn(
                        |status, sequence| println!("frame #{sequence} finished: {status:?}"),
                        usize::from(sequence),
                    ),
                )?;

                let node = loop {
                    match nodes.node(packet) {
                        Ok(node) => break node,
                        Err(rejected) => {
                            packet = rejected.into_inner();
                            thread::sleep(Duration::from_millis(1));
                        }
                    }
                };

                router.submit_node(SOCKET, node)?;

                sequence += 1;
            }

            Ok(())
        }
    });

    interrupt.join().expect("interrupt thread panicked")?;

    while router.stats(SOCKET)?.completed < u64::from(FRAMES) {
        thread::sleep(Duration::from_millis(1));
    }

    drop(consumer);

    println!("{:#?}", router.stats(SOCKET)?);

    Ok(())
}
