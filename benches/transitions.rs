use callcore::call::{CallEvent, CallMachine, Command, PeerState};
use callcore::transport::codec;
use callcore::webrtc::{IceCandidate, SessionDescription, SignalingMessage};
use criterion::{criterion_group, criterion_main, Criterion};
use std::time::SystemTime;

fn candidate(n: u32) -> IceCandidate {
    IceCandidate::from_line(format!("candidate:{} 1 udp 2122260223 192.168.1.{} 5000 typ host", n, n % 250))
}

/// Outgoing call from start to active with eight early candidates, then hang up
fn bench_outgoing_call(c: &mut Criterion) {
    c.bench_function("outgoing_call_to_active", |b| {
        b.iter(|| {
            let mut m = CallMachine::new("alice");
            let _ = m.command(Command::StartCall { to: "bob".into(), audio_only: false });
            let Some(id) = m.session_id() else { return };
            m.handle(CallEvent::MediaReady { session: id });
            m.handle(CallEvent::ConnectionReady { session: id });
            m.handle(CallEvent::OfferCreated { session: id, description: SessionDescription::offer("v=0") });
            for n in 0..8 {
                m.handle(CallEvent::Signal(SignalingMessage::IceCandidate(candidate(n))));
            }
            m.handle(CallEvent::Signal(SignalingMessage::Answer {
                from: "bob".into(),
                to: "alice".into(),
                description: SessionDescription::answer("v=0"),
            }));
            m.handle(CallEvent::RemoteDescriptionApplied { session: id });
            m.handle(CallEvent::PeerStateChanged { session: id, state: PeerState::Connected, at: SystemTime::now() });
            let _ = m.command(Command::End);
            m.handle(CallEvent::TeardownComplete { session: id });
        })
    });
}

fn bench_candidate_decode(c: &mut Criterion) {
    let frames = [
        r#"{"event":"icecandidate","data":{"candidate":{"candidate":"candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}}"#,
        r#"{"event":"icecandidate","data":{"candidate":"candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
        r#"{"event":"icecandidate","data":"candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host"}"#,
    ];
    c.bench_function("decode_candidate_shapes", |b| {
        b.iter(|| {
            for frame in frames {
                let _ = codec::decode(frame);
            }
        })
    });
}

criterion_group!(benches, bench_outgoing_call, bench_candidate_decode);
criterion_main!(benches);
