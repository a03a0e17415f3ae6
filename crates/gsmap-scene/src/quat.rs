use burn::prelude::Backend;
use burn::tensor::Tensor;

fn column<B: Backend>(tensor: &Tensor<B, 2>, index: usize) -> Tensor<B, 2> {
    let rows = tensor.dims()[0];
    tensor.clone().slice([0..rows, index..index + 1])
}

/// Normalize `[N, 4]` quaternions stored as (w, x, y, z).
pub fn normalize<B: Backend>(quats: Tensor<B, 2>) -> Tensor<B, 2> {
    let norm = quats
        .clone()
        .powf_scalar(2.0)
        .sum_dim(1)
        .sqrt()
        .clamp_min(1e-12);
    quats / norm
}

/// Rotate each row of `vectors` (`[N, 3]`) by the matching row of the unnormalized
/// quaternions `quats` (`[N, 4]`, w first).
pub fn rotate_vectors<B: Backend>(quats: Tensor<B, 2>, vectors: Tensor<B, 2>) -> Tensor<B, 2> {
    let quats = normalize(quats);
    let [r, x, y, z] = [0, 1, 2, 3].map(|i| column(&quats, i));
    let [vx, vy, vz] = [0, 1, 2].map(|i| column(&vectors, i));

    let rx = r.clone() * x.clone();
    let ry = r.clone() * y.clone();
    let rz = r * z.clone();
    let xx = x.clone() * x.clone();
    let yy = y.clone() * y.clone();
    let zz = z.clone() * z.clone();
    let xy = x.clone() * y.clone();
    let xz = x * z.clone();
    let yz = y * z;

    let out_x = (-(yy.clone() + zz.clone()) * 2.0 + 1.0) * vx.clone()
        + (xy.clone() - rz.clone()) * 2.0 * vy.clone()
        + (xz.clone() + ry.clone()) * 2.0 * vz.clone();
    let out_y = (xy + rz) * 2.0 * vx.clone()
        + (-(xx.clone() + zz) * 2.0 + 1.0) * vy.clone()
        + (yz.clone() - rx.clone()) * 2.0 * vz.clone();
    let out_z = (xz - ry) * 2.0 * vx + (yz + rx) * 2.0 * vy + (-(xx + yy) * 2.0 + 1.0) * vz;

    Tensor::cat(vec![out_x, out_y, out_z], 1)
}
