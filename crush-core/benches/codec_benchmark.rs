use criterion::{criterion_group, criterion_main, Criterion};
use crush_core::{make_patch, ClientId, Message, PatchSet, Session};
use std::hint::black_box;

fn source(lines: usize) -> String {
    (0..lines)
        .map(|i| format!("def handler_{i}(request):\n    return respond(request, {i})\n"))
        .collect()
}

fn edited(base: &str) -> String {
    base.replacen("respond(request, 7)", "respond(request, 7, cache=True)", 1)
        .replacen("def handler_40", "async def handler_40", 1)
}

fn bench_diff(c: &mut Criterion) {
    let base = source(100);
    let target = edited(&base);

    c.bench_function("diff_100_lines_two_edits", |b| {
        b.iter(|| black_box(crush_core::diff::diff(black_box(&base), black_box(&target))))
    });
}

fn bench_make_patch(c: &mut Criterion) {
    let base = source(100);
    let target = edited(&base);

    c.bench_function("make_patch_to_text", |b| {
        b.iter(|| black_box(make_patch(black_box(&base), black_box(&target)).to_text()))
    });
}

fn bench_apply_exact(c: &mut Criterion) {
    let base = source(100);
    let patch = make_patch(&base, &edited(&base));

    c.bench_function("apply_exact", |b| {
        b.iter(|| black_box(patch.apply(black_box(&base))))
    });
}

fn bench_apply_drifted(c: &mut Criterion) {
    let base = source(100);
    let patch = make_patch(&base, &edited(&base));
    let drifted = format!("# header added by a peer\n{base}");

    c.bench_function("apply_drifted", |b| {
        b.iter(|| black_box(patch.apply(black_box(&drifted))))
    });
}

fn bench_patch_parse(c: &mut Criterion) {
    let base = source(100);
    let text = make_patch(&base, &edited(&base)).to_text();

    c.bench_function("patch_from_text", |b| {
        b.iter(|| black_box(PatchSet::from_text(black_box(&text)).unwrap()))
    });
}

fn bench_message_roundtrip(c: &mut Criterion) {
    let base = source(20);
    let text = make_patch(&base, &edited(&base)).to_text();
    let msg = Message::patch(ClientId::random(), text, 1);

    c.bench_function("patch_message_roundtrip", |b| {
        b.iter(|| {
            let encoded = msg.encode().unwrap();
            black_box(Message::decode(&encoded).unwrap());
        })
    });
}

fn bench_session_tick(c: &mut Criterion) {
    let base = source(100);
    let target = edited(&base);

    c.bench_function("session_tick_and_apply", |b| {
        b.iter(|| {
            let mut a = Session::new(ClientId::from_raw(1));
            let mut peer = Session::new(ClientId::from_raw(2));
            a.set_text(base.clone());
            let seed = a.tick().unwrap();
            peer.handle(seed).unwrap();
            a.set_text(target.clone());
            let msg = a.tick().unwrap();
            black_box(peer.handle(msg).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_diff,
    bench_make_patch,
    bench_apply_exact,
    bench_apply_drifted,
    bench_patch_parse,
    bench_message_roundtrip,
    bench_session_tick,
);
criterion_main!(benches);
