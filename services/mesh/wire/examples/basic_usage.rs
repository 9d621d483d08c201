//! Basic usage example for the mesh wire layouts.

use bytes::Bytes;
use mesh_wire::{
    access_opcode, Address, ControlOpcode, Features, HeartbeatPayload, LowerTransportPdu, PduType,
    SegmentAck, SegmentHeader, SegmentedAccess, UnsegmentedControl,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Mesh Wire Layout Example ===\n");

    // 1. Address classes
    println!("1. Classifying addresses...");
    for address in [Address(0x0000), Address(0x1201), Address(0x8105), Address(0xC105), Address::ALL_NODES] {
        println!(
            "   {} unicast={} virtual={} group={} fixed={}",
            address,
            address.is_unicast(),
            address.is_virtual(),
            address.is_group(),
            address.is_fixed_group()
        );
    }

    // 2. Access opcodes
    println!("\n2. Parsing access opcodes...");
    for payload in [&[0x04u8, 0x00][..], &[0x82, 0x02, 0x01], &[0xC1, 0x59, 0x00, 0x42]] {
        println!("   {:02X?} -> opcode {}", payload, access_opcode(payload)?);
    }

    // 3. A segmented access PDU
    println!("\n3. Encoding a segmented access PDU...");
    let segment = LowerTransportPdu::SegmentedAccess(SegmentedAccess {
        aid: Some(0x26),
        szmic: false,
        header: SegmentHeader::new(0x0005, 1, 2)?,
        segment: Bytes::from_static(&[0xAA; 12]),
    });
    let encoded = segment.encode();
    println!("   {} bytes: {:02X?}", encoded.len(), &encoded[..4]);
    let decoded = LowerTransportPdu::decode(PduType::Access, &encoded)?;
    println!("   Round trip matches: {}", decoded == segment);

    // 4. Acknowledging it
    println!("\n4. Building a Segment Acknowledgment...");
    let ack = SegmentAck {
        obo: false,
        seq_zero: 0x0005,
        block_ack: 0b011,
    };
    println!("   Segment 1 acked: {}", ack.is_acked(1));
    println!("   Segment 2 acked: {}", ack.is_acked(2));
    println!("   All 3 acked: {}", ack.is_complete(3));
    let control = LowerTransportPdu::UnsegmentedControl(UnsegmentedControl {
        opcode: ControlOpcode::SegmentAck as u8,
        parameters: ack.encode(),
    });
    println!("   Control PDU: {:02X?}", &control.encode()[..]);

    // 5. A Heartbeat
    println!("\n5. Encoding a Heartbeat...");
    let heartbeat = HeartbeatPayload {
        init_ttl: 5,
        features: Features::RELAY | Features::FRIEND,
    };
    let parameters = heartbeat.encode();
    println!("   Parameters: {:02X?}", &parameters[..]);
    println!("   Decoded: {:?}", HeartbeatPayload::decode(&parameters)?);

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
