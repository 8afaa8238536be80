//! Shared fixtures for the workbook tests, plus a small evaluator for the formulas the
//! composer writes (`+ - * /`, parentheses, cell references and `SUM(range)`).

#![allow(dead_code)]

use workslip_engine::excel::write_grid;
use workslip_engine::grid::{CellStyle, DocumentGrid, Sheet};

pub fn workbook(sheets: Vec<Sheet>) -> Vec<u8> {
    let mut grid = DocumentGrid::new();
    for sheet in sheets {
        grid.add_sheet(sheet).expect("unique sheet names");
    }
    write_grid(&grid).expect("fixture workbook")
}

/// Estimate sheet with a title row, the header on row 3 and one line per item.
pub fn estimate_sheet(items: &[(&str, &str, f64, f64)]) -> Sheet {
    let mut s = Sheet::new("Estimate");
    s.set(0, 0, "Estimate for repairs to school building");
    let headers = ["Sl.No", "Description", "Unit", "Quantity", "Rate", "Amount"];
    for (c, h) in headers.iter().enumerate() {
        s.set(2, c as u32, *h);
    }
    for (i, (desc, unit, qty, rate)) in items.iter().enumerate() {
        let row = 3 + i as u32;
        s.set(row, 0, (i + 1) as f64);
        s.set(row, 1, *desc);
        s.set(row, 2, *unit);
        s.set(row, 3, *qty);
        s.set(row, 4, *rate);
        s.set(row, 5, qty * rate);
    }
    s
}

/// Bill sheet with quantity and executed columns.
pub fn bill_sheet(name: &str, items: &[(&str, f64, f64, f64)]) -> Sheet {
    let mut s = Sheet::new(name);
    s.set(0, 0, format!("Measurement book: {}", name));
    let headers = ["Sl No", "Description", "Unit", "Qty", "Rate", "Amount", "Executed Qty"];
    for (c, h) in headers.iter().enumerate() {
        s.set(1, c as u32, *h);
    }
    for (i, (desc, qty, rate, executed)) in items.iter().enumerate() {
        let row = 2 + i as u32;
        s.set(row, 0, (i + 1) as f64);
        s.set(row, 1, *desc);
        s.set(row, 2, "cum");
        s.set(row, 3, *qty);
        s.set(row, 4, *rate);
        s.set(row, 5, qty * rate);
        s.set(row, 6, *executed);
    }
    s
}

pub fn heading_style() -> CellStyle {
    CellStyle::default().fill("#FFFF00").font("#FF0000")
}

/// Evaluate the cell at an A1 reference, following formulas.
pub fn eval_ref(sheet: &Sheet, reference: &str) -> f64 {
    let (row, col) = parse_ref(reference).unwrap_or_else(|| panic!("bad reference {}", reference));
    eval_cell(sheet, row, col)
}

pub fn eval_cell(sheet: &Sheet, row: u32, col: u32) -> f64 {
    match sheet.formula(row, col) {
        Some(formula) => eval_formula(sheet, formula),
        None => sheet.number(row, col).unwrap_or(0.0),
    }
}

pub fn eval_formula(sheet: &Sheet, formula: &str) -> f64 {
    let body = formula.strip_prefix('=').unwrap_or(formula);
    let tokens: Vec<char> = body.chars().filter(|c| !c.is_whitespace()).collect();
    let mut parser = Parser { sheet, tokens, pos: 0 };
    let value = parser.expr();
    assert_eq!(parser.pos, parser.tokens.len(), "trailing input in {}", formula);
    value
}

/// `"K12"` -> zero-based (row, col).
pub fn parse_ref(reference: &str) -> Option<(u32, u32)> {
    let letters: String = reference.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    let digits = &reference[letters.len()..];
    if letters.is_empty() || digits.is_empty() {
        return None;
    }
    let col = letters
        .to_ascii_uppercase()
        .chars()
        .fold(0u32, |acc, c| acc * 26 + (c as u32 - 'A' as u32 + 1));
    let row: u32 = digits.parse().ok()?;
    Some((row.checked_sub(1)?, col - 1))
}

struct Parser<'a> {
    sheet: &'a Sheet,
    tokens: Vec<char>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<char> {
        self.tokens.get(self.pos).copied()
    }

    fn expr(&mut self) -> f64 {
        let mut value = self.term();
        while let Some(op @ ('+' | '-')) = self.peek() {
            self.pos += 1;
            let rhs = self.term();
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        value
    }

    fn term(&mut self) -> f64 {
        let mut value = self.factor();
        while let Some(op @ ('*' | '/')) = self.peek() {
            self.pos += 1;
            let rhs = self.factor();
            value = if op == '*' { value * rhs } else { value / rhs };
        }
        value
    }

    fn word(&mut self) -> String {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '.') {
            self.pos += 1;
        }
        self.tokens[start..self.pos].iter().collect()
    }

    fn factor(&mut self) -> f64 {
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                let value = self.expr();
                assert_eq!(self.peek(), Some(')'));
                self.pos += 1;
                value
            }
            Some('-') => {
                self.pos += 1;
                -self.factor()
            }
            _ => {
                let word = self.word();
                if word.eq_ignore_ascii_case("SUM") {
                    assert_eq!(self.peek(), Some('('));
                    self.pos += 1;
                    let from = self.word();
                    assert_eq!(self.peek(), Some(':'));
                    self.pos += 1;
                    let to = self.word();
                    assert_eq!(self.peek(), Some(')'));
                    self.pos += 1;
                    self.sum(&from, &to)
                } else if let Ok(n) = word.parse::<f64>() {
                    n
                } else {
                    eval_ref(self.sheet, &word)
                }
            }
        }
    }

    fn sum(&self, from: &str, to: &str) -> f64 {
        let (r0, c0) = parse_ref(from).expect("range start");
        let (r1, c1) = parse_ref(to).expect("range end");
        let mut total = 0.0;
        for row in r0..=r1 {
            for col in c0..=c1 {
                total += eval_cell(self.sheet, row, col);
            }
        }
        total
    }
}
