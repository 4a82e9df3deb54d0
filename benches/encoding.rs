use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dnp3_rs::app::{Outstation, OutstationConfig};
use dnp3_rs::object::database::{Database, DatabaseConfig};
use dnp3_rs::object::{ClassMask, Flags};
use dnp3_rs::time::{CalendarTime, DnpTimestamp};

fn outstation() -> Outstation<Database> {
    let database = Database::new(DatabaseConfig {
        binaries: 256,
        double_bits: 64,
        counters: 64,
        analogs: 128,
        binary_outputs: 32,
        analog_outputs: 16,
        default_class: ClassMask::CLASS_1,
    });
    let outstation = Outstation::new(OutstationConfig::default(), database);
    outstation.with_database(|db| {
        for i in 0..256 {
            db.update_binary(i, i % 2 == 0, Flags::ONLINE);
        }
        for i in 0..128 {
            db.update_analog(i, i as f64 * 1.5, Flags::ONLINE);
        }
    });
    outstation
}

fn timestamp_benchmark(c: &mut Criterion) {
    let calendar = CalendarTime {
        year: 2024,
        month: 6,
        day: 15,
        hour: 12,
        minute: 30,
        second: 45,
        millisecond: 250,
        day_of_week: 6,
        dst: false,
    };
    c.bench_function("timestamp_round_trip", |b| {
        b.iter(|| {
            let ts = DnpTimestamp::from_calendar(black_box(&calendar));
            black_box(ts.to_calendar())
        })
    });
}

fn static_read_benchmark(c: &mut Criterion) {
    let outstation = outstation();
    let class0 = [0xC0, 0x01, 60, 1, 0x06];
    c.bench_function("class0_read", |b| {
        b.iter(|| outstation.process_fragment(black_box(&class0), 0))
    });
}

fn event_read_benchmark(c: &mut Criterion) {
    let class1 = [0xC0, 0x01, 60, 2, 0x06];
    c.bench_function("class1_event_read", |b| {
        b.iter_with_setup(
            || {
                let outstation = outstation();
                outstation.scan_events(DnpTimestamp::from_millis(1_000));
                outstation
            },
            |outstation| outstation.process_fragment(black_box(&class1), 0),
        )
    });
}

criterion_group!(
    benches,
    timestamp_benchmark,
    static_read_benchmark,
    event_read_benchmark
);
criterion_main!(benches);
