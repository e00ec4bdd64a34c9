//! Lending library demo
//!
//! Run with: cargo run --example library
//!
//! Adds two books, borrows, returns and deletes them, printing the registry
//! after each step. The script runs once with synchronous reclamation and once
//! with deferred reclamation. A replaced record lives at a new address, which
//! the printout shows.

use rcu_registry::{ReclaimMode, RegistryService};

fn print_book(books: &RegistryService, id: u64) {
    let session = books.read_session();
    match books.registry().find(id, &session) {
        Some(book) => tracing::info!(addr = ?(book as *const _), "{}", book),
        None => tracing::warn!(id = id, "Book does not exist"),
    }
}

fn run(books: &RegistryService, mode: ReclaimMode) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(mode = ?mode, "Running library script");

    books.add(0, "book1", "jb")?;
    books.add(1, "book2", "jb")?;
    print_book(books, 0);
    print_book(books, 1);

    tracing::info!("book1 borrowed: {}", books.is_borrowed(0)?);
    tracing::info!("book2 borrowed: {}", books.is_borrowed(1)?);

    books.borrow(0, mode)?;
    books.borrow(1, mode)?;
    print_book(books, 0);
    print_book(books, 1);

    if let Err(e) = books.borrow(0, mode) {
        tracing::info!("Second borrow rejected: {}", e);
    }

    books.return_item(0, mode)?;
    books.return_item(1, mode)?;
    print_book(books, 0);
    print_book(books, 1);

    books.delete(0, mode)?;
    books.delete(1, mode)?;
    print_book(books, 0);
    print_book(books, 1);

    books.barrier();
    let stats = books.stats();
    tracing::info!(
        retired = stats.reclaim.retired,
        reclaimed_inline = stats.reclaim.reclaimed_inline,
        reclaimed_deferred = stats.reclaim.reclaimed_deferred,
        allocated = stats.allocated_records,
        "Script finished"
    );

    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rcu_registry=debug".parse()?)
                .add_directive("library=info".parse()?),
        )
        .init();

    let books = RegistryService::new()?;
    run(&books, ReclaimMode::Sync)?;
    run(&books, ReclaimMode::Async)?;

    Ok(())
}
