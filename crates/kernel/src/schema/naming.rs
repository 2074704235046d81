//! Identifier casing used for aliases, field names and column names.

/// Upper-camel-case a name: `order_line` becomes `OrderLine`.
///
/// Underscores, spaces and dots act as word separators and are dropped.
pub fn camelize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = true;
    for c in name.chars() {
        if matches!(c, '_' | ' ' | '.') {
            upper_next = true;
            continue;
        }
        if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Lower-case the first character only.
pub fn lower_first(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// `order_line` → `orderLine`, `customer` → `customer`.
pub fn lower_camel(name: &str) -> String {
    lower_first(&camelize(name))
}

/// `placedAt` → `placed_at`.
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}
