use anyhow::Context;
use std::fmt::Write as _;
use std::path::Path;

const CELL_PX: u32 = 12;

/// Square count matrix, rows are true classes and columns predictions.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfusionMatrix {
    n: usize,
    counts: Vec<u64>,
}

impl ConfusionMatrix {
    pub fn from_predictions(labels: &[u32], preds: &[u32], n: usize) -> anyhow::Result<Self> {
        if labels.len() != preds.len() {
            anyhow::bail!(
                "label/prediction length mismatch: {} vs {}",
                labels.len(),
                preds.len()
            );
        }
        let mut counts = vec![0u64; n * n];
        for (&t, &p) in labels.iter().zip(preds) {
            let (t, p) = (t as usize, p as usize);
            if t >= n || p >= n {
                anyhow::bail!("class index out of range: true {t}, predicted {p}, classes {n}");
            }
            counts[t * n + p] += 1;
        }
        Ok(Self { n, counts })
    }

    pub fn get(&self, truth: usize, predicted: usize) -> u64 {
        self.counts[truth * self.n + predicted]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let diag: u64 = (0..self.n).map(|i| self.get(i, i)).sum();
        diag as f64 / total as f64
    }

    pub fn write_csv(&self, path: &Path, class_names: &[&str]) -> anyhow::Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("creating {}", path.display()))?;
        let mut header = vec!["true \\ predicted"];
        header.extend(class_names.iter().take(self.n));
        writer.write_record(&header)?;
        for t in 0..self.n {
            let name = class_names.get(t).copied().unwrap_or("?");
            let mut row = vec![name.to_string()];
            row.extend((0..self.n).map(|p| self.get(t, p).to_string()));
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Blue heat map, one `CELL_PX` square per cell, darker means more samples.
    pub fn render_png(&self, path: &Path) -> anyhow::Result<()> {
        let side = self.n as u32 * CELL_PX + 1;
        let max = self.counts.iter().copied().max().unwrap_or(0).max(1) as f32;
        let mut img = image::RgbImage::from_pixel(side, side, image::Rgb([255, 255, 255]));
        for t in 0..self.n {
            for p in 0..self.n {
                let v = self.get(t, p) as f32 / max;
                let shade = image::Rgb([
                    (247.0 - v * 239.0) as u8,
                    (251.0 - v * 203.0) as u8,
                    (255.0 - v * 148.0) as u8,
                ]);
                let (x0, y0) = (p as u32 * CELL_PX, t as u32 * CELL_PX);
                for y in y0..y0 + CELL_PX {
                    for x in x0..x0 + CELL_PX {
                        let grid = x == x0 || y == y0;
                        img.put_pixel(x, y, if grid { image::Rgb([200, 200, 200]) } else { shade });
                    }
                }
            }
        }
        img.save(path)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn to_table(&self, class_names: &[&str]) -> String {
        let width = self
            .counts
            .iter()
            .map(|c| c.to_string().len())
            .max()
            .unwrap_or(1)
            .max(3);
        let label_w = class_names.iter().map(|n| n.len()).max().unwrap_or(1);
        let mut out = String::new();
        let _ = write!(out, "{:label_w$} |", "");
        for p in 0..self.n {
            let _ = write!(out, " {:>width$}", p);
        }
        out.push('\n');
        for t in 0..self.n {
            let name = class_names.get(t).copied().unwrap_or("?");
            let _ = write!(out, "{name:label_w$} |");
            for p in 0..self.n {
                let _ = write!(out, " {:>width$}", self.get(t, p));
            }
            out.push('\n');
        }
        out
    }
}
