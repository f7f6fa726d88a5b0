//! # Cart
//!
//! The order being rung up. Cart mutations are purely local: they are
//! persisted with the entity snapshot but never queued for the backend.
//!
//! ## Line Merging
//! ```text
//! add(Latte, qty 1, [oat], None)     ──► line A: Latte ×1 [oat]
//! add(Latte, qty 2, [oat], None)     ──► line A: Latte ×3 [oat]   (merged)
//! add(Latte, qty 1, [],    None)     ──► line B: Latte ×1         (new)
//! add(Latte, qty 1, [oat], "hot")    ──► line C: Latte ×1 [oat]   (new)
//! ```

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::types::{Modifier, ProductSnapshot};
use crate::validation::validate_quantity;
use crate::{MAX_CART_ITEMS, MAX_ITEM_QUANTITY};

// =============================================================================
// Cart Item
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CartItem {
    /// Local line id; stable while the line lives in a cart or order.
    pub line_id: String,
    pub product: ProductSnapshot,
    pub quantity: i64,
    #[serde(default)]
    pub modifiers: Vec<Modifier>,
    pub notes: Option<String>,
}

impl CartItem {
    /// Product price plus every modifier price.
    pub fn unit_price_cents(&self) -> i64 {
        self.product.price_cents + self.modifiers.iter().map(|m| m.price_cents).sum::<i64>()
    }

    pub fn line_total_cents(&self) -> i64 {
        self.unit_price_cents() * self.quantity
    }

    fn merges_with(&self, product_id: &str, modifiers: &[Modifier], notes: Option<&str>) -> bool {
        self.product.id == product_id
            && self.modifiers.as_slice() == modifiers
            && self.notes.as_deref() == notes
    }
}

// =============================================================================
// Cart
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Cart {
    pub items: Vec<CartItem>,
}

impl Cart {
    /// Adds a product, merging into an existing line when product,
    /// modifiers and notes all match.
    ///
    /// ## Returns
    /// The line id the quantity landed on.
    pub fn add(
        &mut self,
        product: ProductSnapshot,
        quantity: i64,
        modifiers: Vec<Modifier>,
        notes: Option<String>,
    ) -> CoreResult<String> {
        validate_quantity(quantity)?;

        if let Some(line) = self
            .items
            .iter_mut()
            .find(|line| line.merges_with(&product.id, &modifiers, notes.as_deref()))
        {
            let merged = line.quantity + quantity;
            if merged > MAX_ITEM_QUANTITY {
                return Err(CoreError::QuantityTooLarge {
                    requested: merged,
                    max: MAX_ITEM_QUANTITY,
                });
            }
            line.quantity = merged;
            return Ok(line.line_id.clone());
        }

        if self.items.len() >= MAX_CART_ITEMS {
            return Err(CoreError::CartTooLarge { max: MAX_CART_ITEMS });
        }

        let line_id = Uuid::new_v4().to_string();
        self.items.push(CartItem {
            line_id: line_id.clone(),
            product,
            quantity,
            modifiers,
            notes,
        });
        Ok(line_id)
    }

    /// Sets a line's quantity. A quantity of zero or less removes the line.
    pub fn update_quantity(&mut self, line_id: &str, quantity: i64) -> CoreResult<()> {
        if quantity <= 0 {
            return self.remove(line_id);
        }
        if quantity > MAX_ITEM_QUANTITY {
            return Err(CoreError::QuantityTooLarge {
                requested: quantity,
                max: MAX_ITEM_QUANTITY,
            });
        }
        self.line_mut(line_id)?.quantity = quantity;
        Ok(())
    }

    pub fn update_modifiers(&mut self, line_id: &str, modifiers: Vec<Modifier>) -> CoreResult<()> {
        self.line_mut(line_id)?.modifiers = modifiers;
        Ok(())
    }

    pub fn update_notes(&mut self, line_id: &str, notes: Option<String>) -> CoreResult<()> {
        self.line_mut(line_id)?.notes = notes;
        Ok(())
    }

    pub fn remove(&mut self, line_id: &str) -> CoreResult<()> {
        let before = self.items.len();
        self.items.retain(|line| line.line_id != line_id);
        if self.items.len() == before {
            return Err(CoreError::CartLineNotFound(line_id.to_string()));
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn total_cents(&self) -> i64 {
        self.items.iter().map(CartItem::line_total_cents).sum()
    }

    fn line_mut(&mut self, line_id: &str) -> CoreResult<&mut CartItem> {
        self.items
            .iter_mut()
            .find(|line| line.line_id == line_id)
            .ok_or_else(|| CoreError::CartLineNotFound(line_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn latte() -> ProductSnapshot {
        ProductSnapshot::new("p-latte", "Latte", 400, 90)
    }

    fn oat() -> Modifier {
        Modifier {
            id: "m-oat".to_string(),
            name: "Oat milk".to_string(),
            price_cents: 50,
        }
    }

    #[test]
    fn test_add_merges_matching_lines() {
        let mut cart = Cart::default();
        let a = cart.add(latte(), 1, vec![oat()], None).unwrap();
        let b = cart.add(latte(), 2, vec![oat()], None).unwrap();

        assert_eq!(a, b);
        assert_eq!(cart.len(), 1);
        assert_eq!(cart.items[0].quantity, 3);
        assert_eq!(cart.total_cents(), 3 * 450);
    }

    #[test]
    fn test_add_keeps_distinct_lines_apart() {
        let mut cart = Cart::default();
        cart.add(latte(), 1, vec![oat()], None).unwrap();
        cart.add(latte(), 1, vec![], None).unwrap();
        cart.add(latte(), 1, vec![oat()], Some("extra hot".into())).unwrap();

        assert_eq!(cart.len(), 3);
    }

    #[test]
    fn test_zero_quantity_removes_line() {
        let mut cart = Cart::default();
        let line = cart.add(latte(), 2, vec![], None).unwrap();

        cart.update_quantity(&line, 0).unwrap();
        assert!(cart.is_empty());
    }

    #[test]
    fn test_merge_respects_quantity_cap() {
        let mut cart = Cart::default();
        cart.add(latte(), MAX_ITEM_QUANTITY, vec![], None).unwrap();

        let err = cart.add(latte(), 1, vec![], None).unwrap_err();
        assert!(matches!(err, CoreError::QuantityTooLarge { .. }));
        assert_eq!(cart.items[0].quantity, MAX_ITEM_QUANTITY);
    }

    #[test]
    fn test_unknown_line_is_reported() {
        let mut cart = Cart::default();
        assert!(matches!(
            cart.update_notes("nope", None),
            Err(CoreError::CartLineNotFound(_))
        ));
    }
}
