//! Test drive for the arena block allocators.
//!
//! Each subcommand replays a small allocation scenario over a fresh arena and
//! prints the handed-out offsets followed by the allocator's memory map.

use std::process;

use argh::FromArgs;
use arena_alloc::{
    Allocator, Arena, BuddyAllocator, ChainOrder, FreeBits, FreeList, Offset, free_bits,
};
use snafu::{ResultExt as _, Whatever};

mod logger;

/// Replay allocation scenarios over a fixed arena and print memory maps.
#[derive(Debug, FromArgs)]
struct Args {
    /// arena size in bytes (defaults depend on the allocator)
    #[argh(option)]
    arena_size: Option<usize>,
    /// print allocator trace messages
    #[argh(switch, short = 'v')]
    verbose: bool,
    #[argh(subcommand)]
    command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Buddy(BuddyArgs),
    FreeList(FreeListArgs),
    FreeBits(FreeBitsArgs),
}

/// Split blocks into buddies and merge them back.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "buddy")]
struct BuddyArgs {
    /// largest block size
    #[argh(option, default = "512")]
    largest: usize,
    /// smallest block size
    #[argh(option, default = "16")]
    smallest: usize,
    /// keep each size class address-ordered and coalesced
    #[argh(switch)]
    coalesce: bool,
}

/// Allocate and free fixed-size blocks.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "free-list")]
struct FreeListArgs {
    /// block size
    #[argh(option, default = "16")]
    block_size: usize,
    /// keep the chain address-ordered and coalesced
    #[argh(switch)]
    coalesce: bool,
}

/// Allocate contiguous block runs from a bitmask.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "free-bits")]
struct FreeBitsArgs {
    /// block size
    #[argh(option, default = "16")]
    block_size: usize,
}

const fn chain_order(coalesce: bool) -> ChainOrder {
    if coalesce {
        ChainOrder::AddressOrdered
    } else {
        ChainOrder::Unordered
    }
}

fn main() {
    let args: Args = argh::from_env();

    if let Err(err) = run(&args) {
        let report = snafu::Report::from_error(err);
        eprintln!("{report}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Whatever> {
    logger::init(args.verbose).whatever_context("failed to install logger")?;

    let default_size = match &args.command {
        Command::Buddy(_) | Command::FreeList(_) => 4096,
        Command::FreeBits(cmd) => cmd.block_size.saturating_mul(free_bits::MAX_BLOCKS),
    };
    let mut heap = vec![0u8; args.arena_size.unwrap_or(default_size)];
    let arena = Arena::new(&mut heap).whatever_context("failed to create arena")?;
    log::info!("arena of {} bytes", arena.len());

    match &args.command {
        Command::Buddy(cmd) => drive_buddy(arena, cmd),
        Command::FreeList(cmd) => drive_free_list(arena, cmd),
        Command::FreeBits(cmd) => drive_free_bits(arena, cmd),
    }
}

fn alloc<A: Allocator>(allocator: &mut A, size: usize) -> Result<Offset, Whatever> {
    allocator
        .alloc(size)
        .with_whatever_context(|_| format!("failed to allocate {size} bytes"))
}

fn free<A: Allocator>(allocator: &mut A, offset: Offset) -> Result<(), Whatever> {
    allocator
        .free(offset)
        .with_whatever_context(|_| format!("failed to free {offset}"))
}

fn drive_buddy(arena: Arena<'_>, args: &BuddyArgs) -> Result<(), Whatever> {
    let mut buddy =
        BuddyAllocator::with_order(arena, args.largest, args.smallest, chain_order(args.coalesce))
            .whatever_context("failed to create buddy allocator")?;

    let a = alloc(&mut buddy, 32)?;
    let b = alloc(&mut buddy, 32)?;
    let c = alloc(&mut buddy, 64)?;
    let d = alloc(&mut buddy, 64)?;

    println!("a @ {a}");
    println!("b @ {b}");
    println!("c @ {c}");
    println!("d @ {d}");

    for offset in [a, b, d, c] {
        free(&mut buddy, offset)?;
    }

    println!("/Memory Map/");
    println!("{}", buddy.memory_map());
    println!();
    for map in buddy.level_memory_maps() {
        println!("{map}");
    }
    Ok(())
}

fn drive_free_list(arena: Arena<'_>, args: &FreeListArgs) -> Result<(), Whatever> {
    let mut list = FreeList::with_order(arena, args.block_size, true, chain_order(args.coalesce))
        .whatever_context("failed to create free list")?;
    let size = args.block_size;

    let a = alloc(&mut list, size)?;
    let b = alloc(&mut list, size)?;
    let c = alloc(&mut list, size)?;
    free(&mut list, b)?;
    let d = alloc(&mut list, size)?;
    let e = alloc(&mut list, size)?;

    for (name, offset) in [("a", a), ("b", b), ("c", c), ("d", d), ("e", e)] {
        println!("{name} @ {offset}");
    }

    free(&mut list, d)?;
    free(&mut list, c)?;
    let f = alloc(&mut list, size)?;

    println!("f @ {f}");
    println!("/Memory Map/");
    println!("{}", list.memory_map());
    Ok(())
}

const WORD: usize = size_of::<u32>();
const NIL: u32 = u32::MAX;

fn write_word<A: Allocator>(allocator: &mut A, at: Offset, index: usize, value: u32) {
    let offset = Offset::new(at.get() + index * WORD);
    allocator
        .payload_mut(offset, WORD)
        .copy_from_slice(&value.to_ne_bytes());
}

fn read_word<A: Allocator>(allocator: &A, at: Offset, index: usize) -> u32 {
    let offset = Offset::new(at.get() + index * WORD);
    let mut bytes = [0; WORD];
    bytes.copy_from_slice(allocator.arena().bytes(offset, WORD));
    u32::from_ne_bytes(bytes)
}

fn drive_free_bits(arena: Arena<'_>, args: &FreeBitsArgs) -> Result<(), Whatever> {
    let mut bits =
        FreeBits::new(arena, args.block_size).whatever_context("failed to create bitmask")?;

    let a = alloc(&mut bits, 16 * WORD)?;
    println!("a @ {a}");
    let b = alloc(&mut bits, 24 * WORD)?;
    println!("b @ {b}");

    for i in 0..16 {
        write_word(&mut bits, a, i as usize, (i + 1) * (i + 1));
    }
    for i in 0..24 {
        write_word(&mut bits, b, i as usize, (i + 1) * (i + 2));
    }
    for i in 0..16 {
        println!("a[{i}] = {}", read_word(&bits, a, i));
    }
    for i in 0..24 {
        println!("b[{i}] = {}", read_word(&bits, b, i));
    }

    // Each link holds a value word followed by the offset of the next link.
    let mut head = NIL;
    for value in 8..24 {
        let Ok(link) = bits.alloc(2 * WORD) else {
            log::warn!("bitmask exhausted after {} links", value - 8);
            break;
        };
        write_word(&mut bits, link, 0, value);
        write_word(&mut bits, link, 1, head);
        head = u32::try_from(link.get()).whatever_context("link offset exceeds u32")?;
    }

    let mut chain = String::new();
    while head != NIL {
        let link = Offset::new(head as usize);
        chain.push_str(&format!(" {} ->", read_word(&bits, link, 0)));
        head = read_word(&bits, link, 1);
    }
    println!("{chain} |>");

    println!("/Memory Map/");
    println!("{}", bits.memory_map());
    println!("{} bytes available", bits.avail_bytes());
    Ok(())
}
