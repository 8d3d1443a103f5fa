use criterion::criterion_main;


criterion_main!(codec_benchmarks::benches);
