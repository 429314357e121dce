/// key: billing-amount -> payable amount for one charge
///
/// `completed_attempts` must be read from the ledger right before charging so the
/// free first period can only be granted while no charge has ever completed.
pub fn calculate_amount(
    base_amount: i64,
    discount_percent: Option<i32>,
    first_period_free: bool,
    completed_attempts: u64,
) -> i64 {
    if first_period_free && completed_attempts == 0 {
        return 0;
    }

    let base = base_amount.max(0);
    let discount = i64::from(discount_percent.unwrap_or(0).clamp(0, 100));
    // i128 keeps base * 100 from overflowing for very large bases.
    let discounted = i128::from(base) * i128::from(100 - discount) / 100;
    discounted as i64
}
