//! Print what the engine sees in a workbook: sheets, detected headers, bill sheet
//! detection and catalog blocks. Usage: dump_excel <file.xlsx> [catalog-sheet]

use std::collections::BTreeSet;

use tracing::info;
use tracing_subscriber::fmt::time::ChronoLocal;
use workslip_engine::config::EngineConfig;
use workslip_engine::excel::read_grid;
use workslip_engine::grid::column_letter;
use workslip_engine::services::bill_batch::{detect_sheets, BatchContext};
use workslip_engine::services::catalog_indexer::index_catalog;
use workslip_engine::services::header_locator::{
    locate_in_sheet, LocateOptions, BILL_COLUMNS, ESTIMATE_COLUMNS,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_target(false)
        .with_level(true)
        .init();

    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        eprintln!("usage: dump_excel <file.xlsx> [catalog-sheet]");
        std::process::exit(2);
    };
    let mut config = EngineConfig::from_env();
    if let Some(sheet) = args.next() {
        config.catalog.sheet_name = Some(sheet);
    }

    let bytes = std::fs::read(&path)?;
    let grid = read_grid(&bytes, &path)?;
    info!("{}: {} sheet(s)", path, grid.sheets().len());

    let options = LocateOptions::from(&config.header);
    for (index, sheet) in grid.sheets().iter().enumerate() {
        println!(
            "[{}] '{}': last row {}, {} populated row(s)",
            index,
            sheet.name(),
            sheet.max_row().map_or(0, |r| r + 1),
            sheet.populated_row_count()
        );
        for (label, columns) in [("estimate", ESTIMATE_COLUMNS), ("bill", BILL_COLUMNS)] {
            if let Some(header) = locate_in_sheet(sheet, index, columns, &options) {
                let mapped: Vec<String> = header
                    .columns
                    .iter()
                    .map(|(key, col)| format!("{:?}={}", key, column_letter(*col)))
                    .collect();
                println!("    {} header at row {}: {}", label, header.row + 1, mapped.join(", "));
            }
        }
        let colors: BTreeSet<String> = sheet
            .cells()
            .filter_map(|(_, cell)| cell.style.as_ref())
            .filter(|style| style.fill_color.is_some() || style.font_color.is_some())
            .map(|style| {
                format!(
                    "fill {} / font {}",
                    style.fill_color.as_deref().unwrap_or("-"),
                    style.font_color.as_deref().unwrap_or("-")
                )
            })
            .collect();
        for combo in colors {
            println!("    style: {}", combo);
        }
    }

    if let Some((rule, sheets)) = detect_sheets(&grid, &BatchContext::new(&config)) {
        println!("bill sheets ({}): {:?}", rule, sheets);
    }

    match index_catalog(&grid, &config.catalog) {
        Ok(catalog) => {
            println!(
                "catalog '{}': {} block(s) (heading fill {}, font {})",
                catalog.sheet_name(),
                catalog.len(),
                config.catalog.heading_fill,
                config.catalog.heading_font
            );
            for block in catalog.blocks() {
                println!(
                    "    rows {}-{}: {} | rate {} | unit {}",
                    block.start_row + 1,
                    block.end_row + 1,
                    block.name,
                    block.rate.map_or("-".to_string(), |r| r.to_string()),
                    block.unit.as_deref().unwrap_or("-")
                );
            }
        }
        Err(e) => println!("catalog: {}", e),
    }
    Ok(())
}
