//! Wire codec benchmarks.

use burrow_proto::{Message, Name, Rclass, Rdata, RdataType, Rdataset, Section};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn sample_response() -> Message {
    let name: Name = "www.example.com".parse().expect("name");
    let mut message = Message::query(0x1234, name.clone(), RdataType::A, Rclass::In);
    message.flags.qr = true;
    message.flags.aa = true;

    let idx = message.entry_for(Section::Answer, &name);
    let mut rs = Rdataset::new(RdataType::A, 3600);
    for octet in 1..=8u8 {
        rs.rdatas
            .push(Rdata::A(std::net::Ipv4Addr::new(192, 0, 2, octet)));
    }
    message.answers[idx].rdatasets.push(rs);
    message
}

fn bench_render(c: &mut Criterion) {
    let message = sample_response();
    c.bench_function("render_response", |b| {
        b.iter(|| black_box(&message).to_wire(512).expect("render"));
    });
}

fn bench_parse(c: &mut Criterion) {
    let wire = sample_response().to_wire(512).expect("render");
    c.bench_function("parse_response", |b| {
        b.iter(|| Message::from_wire(black_box(&wire)).expect("parse"));
    });
}

criterion_group!(benches, bench_render, bench_parse);
criterion_main!(benches);
