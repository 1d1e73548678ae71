//! 字节级信号统计
//!
//! 所有面向传感器的模块都从这里取统计量，保证同一缓冲区在不同模块里
//! 得到完全一致的熵、噪底和频谱特征。

use sha2::{Digest, Sha256};
use std::borrow::Cow;

use crate::model::GeoPoint;

/// 采样块大小（字节）
pub const CHUNK: usize = 4096;

/// 字节直方图
pub fn histogram(data: &[u8]) -> [u64; 256] {
    let mut counts = [0u64; 256];
    for &b in data {
        counts[b as usize] += 1;
    }
    counts
}

/// 香农熵 (bits/byte)，空输入为 0
pub fn shannon_entropy(data: &[u8]) -> f64 {
    entropy_from_histogram(&histogram(data), data.len() as u64)
}

pub fn entropy_from_histogram(counts: &[u64; 256], total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let n = total as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / n;
            -p * p.log2()
        })
        .sum()
}

/// (均值, 总体标准差)
pub fn mean_std(data: &[u8]) -> (f64, f64) {
    if data.is_empty() {
        return (0.0, 0.0);
    }
    let n = data.len() as f64;
    let mean = data.iter().map(|&b| b as f64).sum::<f64>() / n;
    let var = data
        .iter()
        .map(|&b| {
            let d = b as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    (mean, var.sqrt())
}

/// 噪底：标准差归一化到 [0, 1]（满幅方波的标准差是 127.5）
pub fn noise_floor(data: &[u8]) -> f64 {
    (mean_std(data).1 / 127.5).clamp(0.0, 1.0)
}

/// 有界采样：不超过 `max_len` 时原样借用，否则均匀跨步抽取 4KB 块
pub fn sample(data: &[u8], max_len: usize) -> Cow<'_, [u8]> {
    if data.len() <= max_len {
        return Cow::Borrowed(data);
    }
    let chunks = (max_len / CHUNK).max(1);
    let stride = data.len() / chunks;
    let mut out = Vec::with_capacity(chunks * CHUNK);
    for i in 0..chunks {
        let start = i * stride;
        let end = (start + CHUNK).min(data.len());
        out.extend_from_slice(&data[start..end]);
    }
    Cow::Owned(out)
}

/// 帧级降采样：每 `every` 个 4KB 块保留一个
pub fn subsample_chunks(data: &[u8], every: usize) -> Vec<u8> {
    if every <= 1 {
        return data.to_vec();
    }
    data.chunks(CHUNK)
        .step_by(every)
        .flat_map(|c| c.iter().copied())
        .collect()
}

/// 粗粒度频谱：若干 256 点窗口上的朴素 DFT 幅度，合并成 `bands` 个频带后归一化
///
/// 常量信号（去均值后全零）返回全零向量。
pub fn band_energies(data: &[u8], bands: usize) -> Vec<f64> {
    const WINDOW: usize = 256;
    const MAX_WINDOWS: usize = 8;

    let mut energies = vec![0.0; bands];
    if data.len() < WINDOW || bands == 0 {
        return energies;
    }
    let windows = (data.len() / WINDOW).min(MAX_WINDOWS);
    let stride = data.len() / windows;
    let half = WINDOW / 2;
    let per_band = (half / bands).max(1);

    for w in 0..windows {
        let frame = &data[w * stride..w * stride + WINDOW];
        let mean = frame.iter().map(|&b| b as f64).sum::<f64>() / WINDOW as f64;
        for k in 1..=half {
            let (mut re, mut im) = (0.0, 0.0);
            for (n, &b) in frame.iter().enumerate() {
                let x = b as f64 - mean;
                let phase = 2.0 * std::f64::consts::PI * (k * n) as f64 / WINDOW as f64;
                re += x * phase.cos();
                im -= x * phase.sin();
            }
            let band = ((k - 1) / per_band).min(bands - 1);
            energies[band] += (re * re + im * im).sqrt();
        }
    }

    let total: f64 = energies.iter().sum();
    if total > 0.0 {
        energies.iter_mut().for_each(|e| *e /= total);
    }
    energies
}

/// 分块均值序列
pub fn block_means(data: &[u8], blocks: usize) -> Vec<f64> {
    if data.is_empty() || blocks == 0 {
        return Vec::new();
    }
    let size = (data.len() / blocks).max(1);
    data.chunks(size)
        .take(blocks)
        .map(|c| c.iter().map(|&b| b as f64).sum::<f64>() / c.len() as f64)
        .collect()
}

pub fn mean(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        None
    } else {
        Some(xs.iter().sum::<f64>() / xs.len() as f64)
    }
}

pub fn std_dev(xs: &[f64]) -> Option<f64> {
    let m = mean(xs)?;
    let var = xs.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / xs.len() as f64;
    Some(var.sqrt())
}

/// Pearson 相关系数；长度不足或任一方方差为零时无定义
pub fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 2 {
        return None;
    }
    let (a, b) = (&a[..n], &b[..n]);
    let ma = mean(a)?;
    let mb = mean(b)?;
    let (mut cov, mut va, mut vb) = (0.0, 0.0, 0.0);
    for i in 0..n {
        let da = a[i] - ma;
        let db = b[i] - mb;
        cov += da * db;
        va += da * da;
        vb += db * db;
    }
    if va <= f64::EPSILON || vb <= f64::EPSILON {
        return None;
    }
    Some((cov / (va.sqrt() * vb.sqrt())).clamp(-1.0, 1.0))
}

/// 余弦距离 ∈ [0, 1]（特征向量非负）；两个零向量视为相同，一个零向量视为最远
pub fn cosine_distance(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    match (na > 0.0, nb > 0.0) {
        (false, false) => 0.0,
        (true, true) => (1.0 - dot / (na * nb)).clamp(0.0, 1.0),
        _ => 1.0,
    }
}

/// 大圆距离（公里）
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entropy_bounds() {
        assert_eq!(shannon_entropy(&[]), 0.0);
        assert_eq!(shannon_entropy(&[7u8; 1000]), 0.0);
        let all: Vec<u8> = (0..=255u8).collect();
        assert!((shannon_entropy(&all) - 8.0).abs() < 1e-9);
        let alt: Vec<u8> = (0..1000).map(|i| if i % 2 == 0 { 0 } else { 0xFF }).collect();
        assert!((shannon_entropy(&alt) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn noise_floor_of_square_wave_is_one() {
        let alt: Vec<u8> = (0..1000).map(|i| if i % 2 == 0 { 0 } else { 0xFF }).collect();
        assert!((noise_floor(&alt) - 1.0).abs() < 1e-9);
        assert_eq!(noise_floor(&[0u8; 64]), 0.0);
    }

    #[test]
    fn sample_is_bounded() {
        let data = vec![1u8; 10 * CHUNK];
        assert_eq!(sample(&data, 100 * CHUNK).len(), data.len());
        assert_eq!(sample(&data, 2 * CHUNK).len(), 2 * CHUNK);
    }

    #[test]
    fn subsample_keeps_every_nth_chunk() {
        let data = vec![0u8; 8 * CHUNK];
        assert_eq!(subsample_chunks(&data, 4).len(), 2 * CHUNK);
        assert_eq!(subsample_chunks(&data, 1).len(), data.len());
    }

    #[test]
    fn band_energies_are_normalized() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i * 37 % 251) as u8).collect();
        let e = band_energies(&data, 8);
        assert_eq!(e.len(), 8);
        assert!((e.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(band_energies(&[9u8; 4096], 8).iter().all(|&x| x == 0.0));
    }

    #[test]
    fn pearson_detects_linear_relation() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [2.0, 4.0, 6.0, 8.0];
        assert!((pearson(&a, &b).unwrap() - 1.0).abs() < 1e-9);
        assert!(pearson(&a, &[1.0, 1.0, 1.0, 1.0]).is_none());
    }

    #[test]
    fn cosine_distance_edge_cases() {
        assert_eq!(cosine_distance(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
        assert_eq!(cosine_distance(&[1.0, 0.0], &[0.0, 0.0]), 1.0);
        assert!(cosine_distance(&[1.0, 2.0], &[2.0, 4.0]) < 1e-9);
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn haversine_one_degree_latitude() {
        let d = haversine_km(GeoPoint::new(0.0, 0.0), GeoPoint::new(1.0, 0.0));
        assert!((d - 111.19).abs() < 0.1);
    }
}
