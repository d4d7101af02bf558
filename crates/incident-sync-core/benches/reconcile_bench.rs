//! Reconciliation engine benchmarks
//!
//! Run with: cargo bench -p incident-sync-core

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use incident_sync_core::{reconcile, Question, Response, StaffInvolvement, StaffRole, StalePolicy};
use time::OffsetDateTime;

fn staff(count: u32, suffix: &str) -> Vec<StaffInvolvement> {
    (0..count)
        .map(|sequence| StaffInvolvement {
            sequence,
            staff_username: format!("STAFF{sequence}{suffix}"),
            first_name: "Bench".to_string(),
            last_name: "Officer".to_string(),
            staff_role: StaffRole::Witness,
            comment: None,
        })
        .collect()
}

fn questions(count: u32, answers: u32) -> Vec<Question> {
    (0..count)
        .map(|sequence| Question {
            code: format!("{}", 1000 + sequence),
            sequence,
            question: format!("question {sequence}"),
            additional_information: None,
            responses: (0..answers)
                .map(|answer| Response {
                    code: answer.to_string(),
                    sequence: answer,
                    response: "YES".to_string(),
                    response_date: None,
                    additional_information: None,
                    recorded_by: "BENCH".to_string(),
                    recorded_at: OffsetDateTime::UNIX_EPOCH,
                })
                .collect(),
        })
        .collect()
}

/// Benchmark flat sequence-keyed collections
fn bench_staff(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile_staff");

    for size in [10_u32, 100, 1_000] {
        group.throughput(Throughput::Elements(u64::from(size)));
        group.bench_function(format!("unchanged_{size}"), |b| {
            b.iter_batched(
                || (staff(size, ""), staff(size, "")),
                |(mut existing, incoming)| {
                    black_box(reconcile(&mut existing, incoming, StalePolicy::Delete))
                },
                BatchSize::SmallInput,
            );
        });
        group.bench_function(format!("half_replaced_{size}"), |b| {
            b.iter_batched(
                || (staff(size, ""), staff(size / 2, "-renamed")),
                |(mut existing, incoming)| {
                    black_box(reconcile(&mut existing, incoming, StalePolicy::Delete))
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark nested question/response collections
fn bench_questions(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile_questions");

    group.bench_function("50_questions_4_answers", |b| {
        b.iter_batched(
            || (questions(50, 4), questions(50, 3)),
            |(mut existing, incoming)| {
                black_box(reconcile(&mut existing, incoming, StalePolicy::Delete))
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_staff, bench_questions);
criterion_main!(benches);
