//! Journal line construction.

use crate::error::CommandError;

use super::{Dimensions, JournalLine, Side};

/// A mapped, not yet numbered journal line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostingLine {
    pub account_id: String,
    pub side: Side,
    /// Always positive once added to a [`LineBuilder`].
    pub amount_cents: i64,
    pub dimensions: Dimensions,
    pub memo: Option<String>,
}

/// Accumulates lines, normalising signs and merging duplicates.
#[derive(Debug, Default)]
pub struct LineBuilder {
    lines: Vec<PostingLine>,
}

impl LineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `amount_cents` on `side` of `account_id`.
    ///
    /// Zero amounts are dropped and negative amounts go to the opposite side.
    /// Lines for the same account and dimensions are combined into one: same
    /// side amounts add up, opposite sides net against each other, and a line
    /// that nets to zero disappears.
    pub fn add(
        &mut self,
        account_id: &str,
        side: Side,
        amount_cents: i64,
        dimensions: &Dimensions,
        memo: Option<&str>,
    ) -> Result<(), CommandError> {
        if amount_cents == 0 {
            return Ok(());
        }
        let signed_amount = signed(side, amount_cents)?;

        if let Some(index) = self
            .lines
            .iter()
            .position(|l| l.account_id == account_id && &l.dimensions == dimensions)
        {
            let existing = &mut self.lines[index];
            let net = signed(existing.side, existing.amount_cents)?
                .checked_add(signed_amount)
                .ok_or_else(out_of_range)?;
            if net == 0 {
                self.lines.remove(index);
            } else {
                existing.side = if net > 0 { Side::Debit } else { Side::Credit };
                existing.amount_cents = net.checked_abs().ok_or_else(out_of_range)?;
            }
            return Ok(());
        }

        self.lines.push(PostingLine {
            account_id: account_id.to_string(),
            side: if signed_amount > 0 { Side::Debit } else { Side::Credit },
            amount_cents: signed_amount.checked_abs().ok_or_else(out_of_range)?,
            dimensions: dimensions.clone(),
            memo: memo.map(str::to_string),
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Totals of (debits, credits).
    pub fn totals(&self) -> Result<(i64, i64), CommandError> {
        let mut debit: i64 = 0;
        let mut credit: i64 = 0;
        for line in &self.lines {
            let total = match line.side {
                Side::Debit => &mut debit,
                Side::Credit => &mut credit,
            };
            *total = total
                .checked_add(line.amount_cents)
                .ok_or_else(|| CommandError::validation("entry total out of range"))?;
        }
        Ok((debit, credit))
    }

    /// Number the lines, refusing anything that does not balance to the cent.
    pub fn build(self) -> Result<Vec<JournalLine>, CommandError> {
        let (debit, credit) = self.totals()?;
        if debit != credit {
            return Err(CommandError::validation(format!(
                "entry does not balance: debits {debit} != credits {credit}"
            )));
        }

        Ok(self
            .lines
            .into_iter()
            .enumerate()
            .map(|(i, line)| {
                let (debit_cents, credit_cents) = match line.side {
                    Side::Debit => (line.amount_cents, 0),
                    Side::Credit => (0, line.amount_cents),
                };
                JournalLine {
                    line_number: i as i64 + 1,
                    account_id: line.account_id,
                    debit_cents,
                    credit_cents,
                    dimensions: line.dimensions,
                    memo: line.memo,
                }
            })
            .collect())
    }
}

fn out_of_range() -> CommandError {
    CommandError::validation("amount out of range")
}

/// Debits positive, credits negative.
fn signed(side: Side, amount_cents: i64) -> Result<i64, CommandError> {
    match side {
        Side::Debit => Ok(amount_cents),
        Side::Credit => amount_cents.checked_neg().ok_or_else(out_of_range),
    }
}

/// Swap debits and credits, for reversing entries.
pub fn reverse_lines(lines: &[JournalLine]) -> Vec<JournalLine> {
    lines
        .iter()
        .map(|line| JournalLine {
            debit_cents: line.credit_cents,
            credit_cents: line.debit_cents,
            ..line.clone()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn none() -> Dimensions {
        Dimensions::default()
    }

    #[test]
    fn test_balanced_lines_are_numbered() {
        let mut builder = LineBuilder::new();
        builder.add("1100", Side::Debit, 1000, &none(), None).unwrap();
        builder.add("4000", Side::Credit, 1000, &none(), Some("sale")).unwrap();

        let lines = builder.build().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line_number, 1);
        assert_eq!(lines[0].debit_cents, 1000);
        assert_eq!(lines[1].credit_cents, 1000);
        assert_eq!(lines[1].memo.as_deref(), Some("sale"));
    }

    #[test]
    fn test_negative_amount_flips_side() {
        let mut builder = LineBuilder::new();
        builder.add("4000", Side::Credit, -250, &none(), None).unwrap();
        builder.add("1100", Side::Debit, -250, &none(), None).unwrap();

        let lines = builder.build().unwrap();
        assert_eq!((lines[0].debit_cents, lines[0].credit_cents), (250, 0));
        assert_eq!((lines[1].debit_cents, lines[1].credit_cents), (0, 250));
    }

    #[test]
    fn test_zero_lines_dropped_and_duplicates_merged() {
        let mut builder = LineBuilder::new();
        builder.add("4000", Side::Credit, 300, &none(), None).unwrap();
        builder.add("4000", Side::Credit, 200, &none(), None).unwrap();
        builder.add("2200", Side::Credit, 0, &none(), None).unwrap();
        builder.add("1100", Side::Debit, 500, &none(), None).unwrap();

        let lines = builder.build().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].credit_cents, 500);
    }

    #[test]
    fn test_opposite_sides_net_out() {
        let mut builder = LineBuilder::new();
        builder.add("4000", Side::Credit, 500, &none(), None).unwrap();
        builder.add("4000", Side::Credit, -200, &none(), None).unwrap();
        builder.add("1100", Side::Debit, 300, &none(), None).unwrap();

        let lines = builder.build().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].credit_cents, 300);
    }

    #[test]
    fn test_fully_offsetting_lines_leave_nothing() {
        let mut builder = LineBuilder::new();
        builder.add("4000", Side::Credit, 500, &none(), None).unwrap();
        builder.add("4000", Side::Debit, 500, &none(), None).unwrap();

        assert!(builder.is_empty());
    }

    #[test]
    fn test_different_dimensions_are_kept_apart() {
        let store_a = Dimensions {
            location_id: Some("a".to_string()),
            department_id: None,
        };
        let mut builder = LineBuilder::new();
        builder.add("4000", Side::Credit, 100, &none(), None).unwrap();
        builder.add("4000", Side::Credit, 100, &store_a, None).unwrap();
        builder.add("1100", Side::Debit, 200, &none(), None).unwrap();

        assert_eq!(builder.build().unwrap().len(), 3);
    }

    #[test]
    fn test_unbalanced_is_rejected() {
        let mut builder = LineBuilder::new();
        builder.add("1100", Side::Debit, 1000, &none(), None).unwrap();
        builder.add("4000", Side::Credit, 999, &none(), None).unwrap();

        assert!(matches!(builder.build(), Err(CommandError::Validation(_))));
    }

    #[test]
    fn test_overflow_is_a_validation_error() {
        let mut builder = LineBuilder::new();
        builder.add("1100", Side::Debit, i64::MAX, &none(), None).unwrap();
        assert!(builder.add("1100", Side::Debit, 1, &none(), None).is_err());
        assert!(builder.add("4000", Side::Credit, i64::MIN, &none(), None).is_err());
    }

    #[test]
    fn test_reverse_lines_swaps_sides() {
        let mut builder = LineBuilder::new();
        builder.add("1100", Side::Debit, 10, &none(), None).unwrap();
        builder.add("4000", Side::Credit, 10, &none(), None).unwrap();
        let reversed = reverse_lines(&builder.build().unwrap());

        assert_eq!((reversed[0].debit_cents, reversed[0].credit_cents), (0, 10));
        assert_eq!((reversed[1].debit_cents, reversed[1].credit_cents), (10, 0));
    }
}
