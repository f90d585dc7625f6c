use std::{process, time::Duration};

use clap::{Parser as ClapParser, Subcommand};
use log::info;

use memlab::{BlockInfo, Handle, Memory, MemorySettings, MemoryStats, Result, Scalar, ValueType};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Arena size in bytes
    #[arg(long, default_value_t = 1024 * 1024)]
    arena_size: usize,

    /// Fragmentation at which a collection also compacts
    #[arg(long, default_value_t = 0.5)]
    threshold: f64,

    /// Background collector wake period in milliseconds
    #[arg(long, default_value_t = 10)]
    gc_period_ms: u64,

    /// Run without a background collector
    #[arg(long)]
    no_gc: bool,

    /// Handle table capacity
    #[arg(long, default_value_t = 1 << 16)]
    handles: usize,

    /// Print the block layout when the workload is done
    #[arg(long)]
    dump: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Product of the first N Fibonacci numbers, computed in a managed array
    Fibonacci { n: usize },
    /// Scoped churn: fills a char array with random letters, one temporary
    /// int per element
    RandomArray {
        rounds: usize,
        width: usize,
        #[arg(long, default_value_t = 0x2545_F491)]
        seed: u64,
    },
    /// Fills a 136-byte arena, frees three values and compacts it
    Compaction,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let settings = match cli.command {
        // the scenario needs an exact fit, whatever the flags say
        Command::Compaction => MemorySettings {
            arena_size: 136,
            gc_period: None,
            ..Default::default()
        },
        _ => MemorySettings {
            arena_size: cli.arena_size,
            compact_threshold: cli.threshold,
            gc_period: (!cli.no_gc).then(|| Duration::from_millis(cli.gc_period_ms)),
            handle_capacity: cli.handles,
        },
    };

    let result = Memory::new(settings).and_then(|memory| {
        match cli.command {
            Command::Fibonacci { n } => fibonacci(&memory, n)?,
            Command::RandomArray { rounds, width, seed } => {
                random_array(&memory, rounds, width, seed)?
            }
            Command::Compaction => compaction(&memory)?,
        }

        memory.gc_run();
        print_stats(&memory.stats());
        if cli.dump {
            dump_layout(&memory.layout());
        }
        Ok(())
    });

    if let Err(err) = result {
        eprintln!("Error: {}", err);
        process::exit(1);
    }
}

fn fibonacci(memory: &Memory, n: usize) -> Result<()> {
    let expected = (0..n)
        .scan((1i32, 1i32), |state, _| {
            let value = state.0;
            *state = (state.1, state.0.wrapping_add(state.1));
            Some(value)
        })
        .fold(1i32, |acc, v| acc.wrapping_mul(v));
    println!("Actual Product: {}", expected);

    let _scope = memory.scope();
    let count = memory.create_var(ValueType::Int)?;
    memory.assign_var(count, Scalar::Int(n as i32))?;
    let product = fibonacci_product(memory, count)?;

    let value = memory.get_var(product, ValueType::Int)?;
    println!("Final Product: {}", value.as_int().unwrap_or_default());
    Ok(())
}

fn fibonacci_product(memory: &Memory, count: Handle) -> Result<Handle> {
    let n = memory.get_var(count, ValueType::Int)?.as_int().unwrap_or_default().max(0) as usize;

    let fib = memory.create_arr(ValueType::Int, n)?;
    for i in 0..n {
        let value = if i < 2 {
            1
        } else {
            let a = memory.get_elem(fib, ValueType::Int, i - 1)?;
            let b = memory.get_elem(fib, ValueType::Int, i - 2)?;
            a.as_int().unwrap_or_default().wrapping_add(b.as_int().unwrap_or_default())
        };
        memory.assign_elem(fib, i, Scalar::Int(value))?;
    }

    let product = memory.create_var(ValueType::Int)?;
    let mut acc = 1i32;
    for i in 0..n {
        let value = memory.get_elem(fib, ValueType::Int, i)?;
        acc = acc.wrapping_mul(value.as_int().unwrap_or_default());
    }
    memory.assign_var(product, Scalar::Int(acc))?;
    memory.free_elem(fib)?;
    memory.gc_run();
    Ok(product)
}

/// xorshift64*
struct Rng(u64);

impl Rng {
    fn next_u64(&mut self) -> u64 {
        self.0 ^= self.0 >> 12;
        self.0 ^= self.0 << 25;
        self.0 ^= self.0 >> 27;
        self.0.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }
}

fn random_array(memory: &Memory, rounds: usize, width: usize, seed: u64) -> Result<()> {
    let mut rng = Rng(seed.max(1));
    for round in 0..rounds {
        let _scope = memory.scope();
        let arr = memory.create_arr(ValueType::Char, width)?;
        for i in 0..width {
            let _inner = memory.scope();
            let tmp = memory.create_var(ValueType::Int)?;
            memory.assign_var(tmp, Scalar::Int((rng.next_u64() % 26) as i32))?;
            let r = memory.get_var(tmp, ValueType::Int)?;
            let c = b'a' + r.as_int().unwrap_or_default() as u8;
            memory.assign_elem(arr, i, Scalar::Char(c))?;
        }

        let preview: String = (0..width.min(16))
            .map(|i| {
                memory
                    .get_elem(arr, ValueType::Char, i)
                    .map(|c| c.as_char().unwrap_or(b'?') as char)
            })
            .collect::<Result<_>>()?;
        info!("round {round}: {preview}");
        memory.free_elem(arr)?;
    }
    Ok(())
}

fn compaction(memory: &Memory) -> Result<()> {
    let p1 = memory.create_var(ValueType::Int)?;
    let p2 = memory.create_var(ValueType::Int)?;
    let arr1 = memory.create_arr(ValueType::Int, 10)?;
    let _p3 = memory.create_var(ValueType::Int)?;
    let p4 = memory.create_var(ValueType::Int)?;
    let _arr2 = memory.create_arr(ValueType::Int, 10)?;
    for i in 0..10 {
        memory.assign_elem(arr1, i, Scalar::Int(i as i32 * 7))?;
    }

    memory.free_elem(p1)?;
    memory.free_elem(p2)?;
    memory.free_elem(p4)?;
    println!("before compaction:");
    dump_layout(&memory.layout());

    let moved = memory.compact();
    println!("after compaction ({} blocks moved):", moved);
    dump_layout(&memory.layout());

    let last = memory.get_elem(arr1, ValueType::Int, 9)?;
    println!("arr1[9] = {}", last.as_int().unwrap_or_default());
    Ok(())
}

fn print_stats(stats: &MemoryStats) {
    println!(
        "live handles: {}, free: {}/{} words in {} blocks (biggest {})",
        stats.live_handles,
        stats.free_words,
        stats.total_words,
        stats.free_blocks,
        stats.biggest_free_words
    );
    println!("open scopes: {}, tracked handles: {}", stats.open_scopes, stats.tracked_handles);
    println!(
        "gc: {} cycles, {} handles / {} words reclaimed, {} compactions",
        stats.gc.cycles,
        stats.gc.reclaimed_handles,
        stats.gc.reclaimed_words,
        stats.gc.compactions
    );
}

fn dump_layout(blocks: &[BlockInfo]) {
    for block in blocks {
        println!(
            "  {:>8}  {:>6} words  {}",
            block.word,
            block.words,
            if block.free { "free" } else { "used" }
        );
    }
}
