use bacstack::encoding::{
    decode_application_unsigned, decode_property_value, decode_tag, encode_application_real,
    encode_application_unsigned, encode_property_value, encode_tag, TagClass, TagContent,
};
use bacstack::object::PropertyValue;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn encode_benchmark(c: &mut Criterion) {
    c.bench_function("encode_tag_extended", |b| {
        b.iter(|| {
            let mut buffer = Vec::with_capacity(8);
            encode_tag(
                &mut buffer,
                black_box(20),
                TagClass::Context,
                TagContent::Length(black_box(300)),
            );
            black_box(buffer)
        })
    });

    c.bench_function("encode_application_unsigned", |b| {
        b.iter(|| {
            let mut buffer = Vec::with_capacity(8);
            encode_application_unsigned(&mut buffer, black_box(0xDEAD));
            black_box(buffer)
        })
    });

    c.bench_function("encode_property_value_real", |b| {
        let value = PropertyValue::Real(72.5);
        b.iter(|| {
            let mut buffer = Vec::with_capacity(8);
            encode_property_value(&mut buffer, black_box(&value));
            black_box(buffer)
        })
    });
}

fn decode_benchmark(c: &mut Criterion) {
    let mut unsigned = Vec::new();
    encode_application_unsigned(&mut unsigned, 0xDEAD);
    c.bench_function("decode_application_unsigned", |b| {
        b.iter(|| decode_application_unsigned(black_box(&unsigned)).unwrap())
    });

    let mut real = Vec::new();
    encode_application_real(&mut real, 72.5);
    c.bench_function("decode_property_value_real", |b| {
        b.iter(|| decode_property_value(black_box(&real)).unwrap())
    });

    let mut tagged = Vec::new();
    encode_tag(&mut tagged, 20, TagClass::Context, TagContent::Length(300));
    c.bench_function("decode_tag_extended", |b| {
        b.iter(|| decode_tag(black_box(&tagged), 0).unwrap())
    });
}

criterion_group!(benches, encode_benchmark, decode_benchmark);
criterion_main!(benches);
