// Copyright 2017-2019 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#[macro_use]
extern crate criterion;

use criterion::black_box;
use criterion::Criterion;
use hermes::notation;
use hermes::transport::Message;
use hermes::{Dialect, SlotColor};

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("convert move list uci to usi", |b| {
        b.iter(|| {
            notation::convert_move_list(
                black_box("e2e4 e7e5 g1f3 b8c6 f1b5 a7a6 b5a4 g8f6"),
                Dialect::Uci,
                Dialect::Usi,
                8,
                8,
            )
        })
    });

    c.bench_function("convert move list with drops and promotions", |b| {
        b.iter(|| {
            notation::convert_move_list(
                black_box("P@e4 e7e8q c7c8+ N@b6"),
                Dialect::Uci,
                Dialect::Usi,
                8,
                8,
            )
        })
    });

    c.bench_function("fen to alternate fen with hand", |b| {
        b.iter(|| {
            notation::fen_to_alternate_fen(black_box(
                "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR[QQQNNPpp] w KQkq - 0 1",
            ))
        })
    });

    c.bench_function("frame decode post message", |b| {
        b.iter(|| Message::decode(black_box("POST_MSG|stockfish|0|go depth 20")))
    });

    c.bench_function("frame encode stdout chunk", |b| {
        let message = Message::EngineStdout {
            id: "stockfish".to_owned(),
            slot: SlotColor::White,
            chunk: "info depth 20 seldepth 30 score cp 35 pv e2e4 e7e5 g1f3\n".to_owned(),
        };
        b.iter(|| black_box(&message).encode())
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
