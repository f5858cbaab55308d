pub mod quantile;
pub mod ss;
