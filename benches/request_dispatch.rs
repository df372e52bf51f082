use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use http::Method;
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::TcpStream,
	runtime::Builder,
};

// ----------

use banyan::{registry, DefaultInterceptor, ListenEndpoint, NextHandler};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

pub fn request_dispatch(c: &mut Criterion) {
	let runtime = Builder::new_multi_thread()
		.worker_threads(1)
		.enable_all()
		.build()
		.unwrap();

	// One listener for the whole group; entries past the hit are never
	// walked, entries before it always are.
	let server = runtime.block_on(async {
		let server = registry()
			.create_plain("bench", ListenEndpoint::new("127.0.0.1", 0), 0)
			.unwrap();

		let mut interceptor = DefaultInterceptor::with_prefix("/v1");

		for index in 0..31 {
			let pattern = format!("/apps/app{}/streams/(.+)", index);
			interceptor.register(Method::GET, &pattern, |_, response| {
				response.set_body("{}");

				NextHandler::DoNotCall
			});
		}

		interceptor.register(Method::GET, "/stats", |_, response| {
			response.set_body("{}");

			NextHandler::DoNotCall
		});

		server.add_interceptor(Arc::new(interceptor));

		server
	});

	let address = server.local_address();

	let mut bench_group = c.benchmark_group("request_dispatch");
	bench_group.sample_size(1000);

	bench_group.bench_function(BenchmarkId::new("pattern walk", 1), |b| {
		b.to_async(&runtime).iter(|| async move {
			let mut stream = TcpStream::connect(address).await.unwrap();
			stream
				.write_all(b"GET /v1/apps/app0/streams/live HTTP/1.1\r\nHost: localhost\r\n\r\n")
				.await
				.unwrap();

			let mut response = Vec::new();
			stream.read_to_end(&mut response).await.unwrap();
			assert!(response.starts_with(b"HTTP/1.1 200 OK"));
		})
	});

	bench_group.bench_function(BenchmarkId::new("pattern walk", 32), |b| {
		b.to_async(&runtime).iter(|| async move {
			let mut stream = TcpStream::connect(address).await.unwrap();
			stream
				.write_all(b"GET /v1/stats HTTP/1.1\r\nHost: localhost\r\n\r\n")
				.await
				.unwrap();

			let mut response = Vec::new();
			stream.read_to_end(&mut response).await.unwrap();
			assert!(response.starts_with(b"HTTP/1.1 200 OK"));
		})
	});

	bench_group.finish();
}

criterion_group!(benches, request_dispatch);
criterion_main!(benches);
