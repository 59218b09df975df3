// Producer-consumer over a bounded channel, with shared services from a registry.
//
// Run with: cargo run --bin patterns_demo [config.toml]
// Set RUST_LOG=debug to see the library's tracing output.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use concurrency_patterns::{BoundedChannel, Config, LazyRegistry};
use tracing_subscriber::EnvFilter;

struct PriceFeed {
    name: String,
    multiplier: u64,
}

impl PriceFeed {
    fn quote(&self, order: u64) -> u64 {
        order * self.multiplier
    }
}

fn load_config() -> Config {
    match std::env::args().nth(1) {
        Some(path) => Config::load(&path).unwrap_or_else(|err| {
            eprintln!("{err}; falling back to defaults");
            Config::default()
        }),
        None => Config::default(),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = load_config();
    println!("=== Singleton Registry + Bounded Channel ===\n");
    println!("channel capacity: {}", config.channel.capacity);

    // Composition root: the registry is owned here and lent to the workers.
    let registry: LazyRegistry<PriceFeed> = LazyRegistry::from_config(&config.registry);
    let channel: BoundedChannel<u64> = BoundedChannel::from_config(&config.channel);
    let feed_builds = AtomicUsize::new(0);

    let processed = crossbeam::scope(|s| {
        let producers: Vec<_> = (0..2u64)
            .map(|producer_id| {
                let channel = &channel;
                let config = &config;
                s.spawn(move |_| {
                    for order in 0..5 {
                        let item = producer_id * 100 + order;
                        match channel.put(item, &config.channel.put_context()) {
                            Ok(()) => println!("Producer {producer_id}: queued order {item}"),
                            Err(err) => println!("Producer {producer_id}: {err}"),
                        }
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..3)
            .map(|consumer_id| {
                let channel = &channel;
                let registry = &registry;
                let feed_builds = &feed_builds;
                s.spawn(move |_| {
                    let mut handled = 0;
                    for order in channel.iter() {
                        let feed = registry.get_or_create("prices", || {
                            feed_builds.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(20));
                            Ok::<_, std::io::Error>(PriceFeed {
                                name: "exchange".to_string(),
                                multiplier: 3,
                            })
                        });
                        match feed {
                            Ok(feed) => {
                                println!(
                                    "  Consumer {consumer_id}: order {order} priced at {} by {}",
                                    feed.quote(order),
                                    feed.name
                                );
                                handled += 1;
                            }
                            Err(err) => println!("  Consumer {consumer_id}: {err}"),
                        }
                    }
                    handled
                })
            })
            .collect();

        // Close once every producer is done so consumers drain and stop.
        for producer in producers {
            producer.join().unwrap();
        }
        channel.close();

        consumers
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .sum::<usize>()
    })
    .unwrap();

    println!("\n=== Summary ===");
    println!("orders processed: {processed}");
    println!("price feed built {} time(s)", feed_builds.load(Ordering::SeqCst));
    println!("registry keys: {:?}", registry.keys());
}
