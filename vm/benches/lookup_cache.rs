use criterion::{black_box, criterion_group, criterion_main, Criterion};

use bytecode::BytecodeBuilder;
use object::{ClassFlags, Selector, SelectorKind, Value};
use vm::lookup::LookupCache;
use vm::program::ProgramBuilder;

fn bench_lookup(c: &mut Criterion) {
    let mut builder = ProgramBuilder::new();
    let selector = Selector::encode(40, SelectorKind::Method, 0);

    let mut b = BytecodeBuilder::new();
    b.load_literal(1);
    b.ret(1, 1);
    b.method_end();
    let target = builder.add_function(0, b.as_bytes(), &[], &[]);

    let class = builder.add_class(0, ClassFlags::NONE, Value::from_raw(0));
    builder.set_class_methods(class, &[(selector, target)]);
    let program = builder.finish();

    let mut cache = LookupCache::new();
    c.bench_function("method_lookup_cached", |bench| {
        bench.iter(|| {
            let entry = cache.lookup(&program, black_box(class), black_box(selector));
            black_box(entry.target)
        })
    });

    c.bench_function("method_lookup_cold", |bench| {
        bench.iter(|| {
            cache.clear();
            let entry = cache.lookup(&program, black_box(class), black_box(selector));
            black_box(entry.target)
        })
    });
}

criterion_group!(benches, bench_lookup);
criterion_main!(benches);
