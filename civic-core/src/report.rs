use crate::labels::Labels;
use serde::Serialize;
use std::fmt;

/// Counts of (true class, predicted class) pairs; rows are true classes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ConfusionMatrix {
    counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            counts: vec![vec![0; num_classes]; num_classes],
        }
    }

    /// Pairs naming a class outside `0..num_classes` are ignored.
    pub fn from_predictions(num_classes: usize, truth: &[usize], predicted: &[usize]) -> Self {
        let mut matrix = Self::new(num_classes);
        for (t, p) in truth.iter().zip(predicted) {
            matrix.record(*t, *p);
        }
        matrix
    }

    pub fn record(&mut self, truth: usize, predicted: usize) {
        if let Some(cell) = self.counts.get_mut(truth).and_then(|row| row.get_mut(predicted)) {
            *cell += 1;
        }
    }

    pub fn num_classes(&self) -> usize {
        self.counts.len()
    }

    pub fn get(&self, truth: usize, predicted: usize) -> usize {
        self.counts[truth][predicted]
    }

    pub fn rows(&self) -> &[Vec<usize>] {
        &self.counts
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    fn support(&self, class: usize) -> usize {
        self.counts[class].iter().sum()
    }

    fn predicted(&self, class: usize) -> usize {
        self.counts.iter().map(|row| row[class]).sum()
    }
}

/// Printed like a numpy integer array: right-aligned, one row per line.
impl fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .counts
            .iter()
            .flatten()
            .map(|c| c.to_string().len())
            .max()
            .unwrap_or(1);
        if self.counts.is_empty() {
            return write!(f, "[]");
        }
        for (i, row) in self.counts.iter().enumerate() {
            let cells = row
                .iter()
                .map(|c| format!("{c:>width$}"))
                .collect::<Vec<_>>()
                .join(" ");
            let open = if i == 0 { "[[" } else { " [" };
            let close = if i + 1 == self.counts.len() { "]]" } else { "]\n" };
            write!(f, "{open}{cells}{close}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassMetrics {
    pub label: String,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub support: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Average {
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub support: usize,
}

/// Per-class precision, recall and F1 with accuracy, macro and weighted averages.
/// A ratio with a zero denominator counts as 0.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationReport {
    pub classes: Vec<ClassMetrics>,
    pub accuracy: f64,
    pub macro_avg: Average,
    pub weighted_avg: Average,
}

fn ratio(num: usize, den: usize) -> f64 {
    match den {
        0 => 0.,
        den => num as f64 / den as f64,
    }
}

impl ClassificationReport {
    pub fn new(matrix: &ConfusionMatrix, labels: &Labels) -> Self {
        let classes = (0..matrix.num_classes())
            .map(|class| {
                let tp = matrix.get(class, class);
                let support = matrix.support(class);
                let precision = ratio(tp, matrix.predicted(class));
                let recall = ratio(tp, support);
                let f1_score = match precision + recall {
                    sum if sum > 0. => 2. * precision * recall / sum,
                    _ => 0.,
                };
                ClassMetrics {
                    label: labels
                        .name(class)
                        .map(str::to_string)
                        .unwrap_or_else(|| class.to_string()),
                    precision,
                    recall,
                    f1_score,
                    support,
                }
            })
            .collect::<Vec<_>>();

        let total = matrix.total();
        let correct = (0..matrix.num_classes()).map(|c| matrix.get(c, c)).sum();
        let n = classes.len().max(1) as f64;
        let macro_avg = Average {
            precision: classes.iter().map(|c| c.precision).sum::<f64>() / n,
            recall: classes.iter().map(|c| c.recall).sum::<f64>() / n,
            f1_score: classes.iter().map(|c| c.f1_score).sum::<f64>() / n,
            support: total,
        };
        let weighted = |metric: fn(&ClassMetrics) -> f64| match total {
            0 => 0.,
            total => {
                classes
                    .iter()
                    .map(|c| metric(c) * c.support as f64)
                    .sum::<f64>()
                    / total as f64
            }
        };
        let weighted_avg = Average {
            precision: weighted(|c| c.precision),
            recall: weighted(|c| c.recall),
            f1_score: weighted(|c| c.f1_score),
            support: total,
        };

        Self {
            accuracy: ratio(correct, total),
            classes,
            macro_avg,
            weighted_avg,
        }
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().map(|c| c.label.as_str())
    }
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const WEIGHTED: &str = "weighted avg";
        let width = self
            .classes
            .iter()
            .map(|c| c.label.chars().count())
            .chain([WEIGHTED.len()])
            .max()
            .unwrap_or(WEIGHTED.len());

        let row = |f: &mut fmt::Formatter<'_>, name: &str, p: f64, r: f64, f1: f64, s: usize| {
            writeln!(f, "{name:>width$}  {p:>9.2} {r:>9.2} {f1:>9.2} {s:>9}")
        };

        writeln!(
            f,
            "{:>width$}  {:>9} {:>9} {:>9} {:>9}",
            "", "precision", "recall", "f1-score", "support"
        )?;
        writeln!(f)?;
        for c in &self.classes {
            row(f, &c.label, c.precision, c.recall, c.f1_score, c.support)?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:>width$}  {:>9} {:>9} {:>9.2} {:>9}",
            "accuracy", "", "", self.accuracy, self.macro_avg.support
        )?;
        let m = &self.macro_avg;
        row(f, "macro avg", m.precision, m.recall, m.f1_score, m.support)?;
        let w = &self.weighted_avg;
        row(f, WEIGHTED, w.precision, w.recall, w.f1_score, w.support)
    }
}
