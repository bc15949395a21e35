use criterion::{Criterion, criterion_group, criterion_main};
use luau_bridge::{CallbackId, Exec, FuncReg, FunctionTable, OptLevel, Outcome, StackOps, State, TableOps, compile};
use std::hint::black_box;
use std::sync::Arc;

const FIB: &str = r#"
local function fib(n)
    if n < 2 then return n end
    return fib(n - 1) + fib(n - 2)
end
result = fib(20)
"#;

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    for level in [OptLevel::None, OptLevel::O2] {
        group.bench_function(format!("fib_{:?}", level), |b| {
            b.iter(|| compile(black_box(FIB.as_bytes()), level).unwrap())
        });
    }
    group.finish();
}

fn bench_run(c: &mut Criterion) {
    let state = State::new().unwrap();
    let bytecode = compile(FIB.as_bytes(), OptLevel::O2).unwrap();
    c.bench_function("run_fib_20", |b| {
        b.iter(|| {
            state.load_bytecode(black_box(&bytecode), "=fib").unwrap();
            state.pcall(0, 0).unwrap();
        })
    });
}

fn bench_stack(c: &mut Criterion) {
    let state = State::new().unwrap();
    c.bench_function("push_read_pop_string", |b| {
        b.iter(|| {
            state.push_string(black_box("marshalled value"));
            let len = state.string_len(-1);
            state.pop(1);
            black_box(len)
        })
    });
}

fn native_inc(frame: &luau_bridge::Frame) -> luau_bridge::Result<Outcome> {
    frame.push_number(frame.to_number(1) + 1.0);
    Ok(Outcome::returns(1))
}

fn bench_calls(c: &mut Criterion) {
    let mut group = c.benchmark_group("host_calls");

    let native = State::new().unwrap();
    native.register(&[FuncReg::native("inc", native_inc)]).unwrap();
    group.bench_function("native_x1000", |b| {
        b.iter(|| native.run("local n = 0 for i = 1, 1000 do n = inc(n) end").unwrap())
    });

    let external = State::new().unwrap();
    let table = Arc::new(FunctionTable::new());
    let id: CallbackId = table.insert("inc", native_inc);
    external.set_dispatcher(Arc::clone(&table));
    external.register_external("inc", id).unwrap();
    group.bench_function("external_x1000", |b| {
        b.iter(|| external.run("local n = 0 for i = 1, 1000 do n = inc(n) end").unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_compile, bench_run, bench_stack, bench_calls);
criterion_main!(benches);
