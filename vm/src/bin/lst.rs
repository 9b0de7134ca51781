use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use heap::{HeapConfig, MemoryManager};
use object::Process;
use vm::{ExecuteResult, HandleScope, Vm};

/// Little Smalltalk bytecode interpreter.
#[derive(Parser)]
#[command(name = "lst", version, about)]
struct Args {
    /// Image file to load.
    image: PathBuf,

    /// Total heap size in bytes (split into two semispaces).
    #[arg(long, default_value_t = 8 * 1024 * 1024)]
    heap_size: usize,

    /// Bytecodes per scheduling slice.
    #[arg(long, default_value_t = 100_000)]
    ticks: u32,

    /// Print collector statistics on exit.
    #[arg(long)]
    gc_stats: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = HeapConfig {
        heap_size: args.heap_size,
    };

    let mut vm = match Vm::from_image_file(config, &args.image) {
        Ok(vm) => vm,
        Err(err) => {
            eprintln!("lst: {err}");
            return ExitCode::FAILURE;
        }
    };

    let initial = vm.globals().initial_method;
    if !initial.is_ref() || vm.globals().is_nil(initial) {
        eprintln!("lst: image has no initial method");
        return ExitCode::FAILURE;
    }
    let nil = vm.globals().nil;
    let process = match vm::bootstrap::make_process(&mut vm, initial, nil, &[])
    {
        Ok(process) => process,
        Err(err) => {
            eprintln!("lst: {err}");
            return ExitCode::FAILURE;
        }
    };

    // SAFETY: the scope drops before the VM (and its heap) does.
    let scope = unsafe { HandleScope::new(&mut vm.heap) };
    let process = scope.pin(process);

    let code = loop {
        match vm.execute(process.get(), args.ticks) {
            ExecuteResult::TimeExpired => continue,
            ExecuteResult::Break => {
                tracing::info!("breakpoint hit, resuming");
            }
            ExecuteResult::Returned => {
                // SAFETY: the handle tracked any relocation.
                let result =
                    unsafe { process.get().as_obj::<Process>() }.result;
                println!("{result:?}");
                break ExitCode::SUCCESS;
            }
            ExecuteResult::BadMethod => {
                eprintln!("lst: message not understood");
                break ExitCode::FAILURE;
            }
            ExecuteResult::Error | ExecuteResult::NoReturn => {
                eprintln!("lst: process aborted");
                break ExitCode::FAILURE;
            }
        }
    };

    if args.gc_stats {
        let stats = vm.heap.stats();
        eprintln!(
            "collections: {} (left-to-right {}, right-to-left {}), \
             total {:?}, full passes {:?}",
            stats.collections,
            stats.left_to_right,
            stats.right_to_left,
            stats.total_delay,
            stats.right_delay,
        );
    }

    drop(scope);
    code
}
