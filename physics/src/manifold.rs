use crate::{
    body::{Body, BodyHandle},
    contact::ContactPoint,
};
use glam::Vec3;

pub const MAX_CONTACTS: usize = 4;

/// Distance a point may drift, along or across the normal, before it is dropped.
pub const CONTACT_BREAKING_THRESHOLD: f32 = 0.02;

/// Up to four contact points between two bodies, kept across steps for warm starting.
#[derive(Copy, Clone, Debug)]
pub struct PersistentManifold {
    contacts: [ContactPoint; MAX_CONTACTS],
    num_contacts: u8,
    handle_a: BodyHandle,
    handle_b: BodyHandle,
    pub breaking_threshold: f32,
}

impl PersistentManifold {
    pub fn new(handle_a: BodyHandle, handle_b: BodyHandle) -> Self {
        Self {
            contacts: [ContactPoint::default(); MAX_CONTACTS],
            num_contacts: 0,
            handle_a,
            handle_b,
            breaking_threshold: CONTACT_BREAKING_THRESHOLD,
        }
    }

    pub fn handle_a(&self) -> BodyHandle {
        self.handle_a
    }

    pub fn handle_b(&self) -> BodyHandle {
        self.handle_b
    }

    pub fn num_contacts(&self) -> usize {
        self.num_contacts as usize
    }

    pub fn is_empty(&self) -> bool {
        self.num_contacts == 0
    }

    pub fn contacts(&self) -> &[ContactPoint] {
        &self.contacts[0..self.num_contacts as usize]
    }

    pub fn contacts_mut(&mut self) -> &mut [ContactPoint] {
        &mut self.contacts[0..self.num_contacts as usize]
    }

    /// Index of the existing point closest to `contact` on body A, if within the threshold.
    pub fn find_cached_point(&self, contact: &ContactPoint) -> Option<usize> {
        let mut min_dist_sq = self.breaking_threshold * self.breaking_threshold;
        let mut nearest = None;
        for (index, existing) in self.contacts().iter().enumerate() {
            let dist_sq = (existing.local_point_a - contact.local_point_a).length_squared();
            if dist_sq < min_dist_sq {
                min_dist_sq = dist_sq;
                nearest = Some(index);
            }
        }
        nearest
    }

    /// Adds a point with body A and B in this manifold's order.
    ///
    /// A point close to an existing one replaces it and inherits its impulses. When full, the
    /// point closest to the average of all five is dropped, which may be the new one. Returns
    /// the slot used.
    pub fn add_contact(&mut self, mut contact: ContactPoint) -> Option<usize> {
        if let Some(index) = self.find_cached_point(&contact) {
            contact.inherit_impulses(&self.contacts[index]);
            self.contacts[index] = contact;
            return Some(index);
        }

        // if we're all full on contacts then keep the contacts that are furthest away from each
        // other
        let mut new_slot = self.num_contacts as usize;
        if new_slot >= MAX_CONTACTS {
            let mut avg = contact.local_point_a;
            for existing in &self.contacts {
                avg += existing.local_point_a;
            }
            avg *= 0.2;

            let mut min_dist = (avg - contact.local_point_a).length_squared();
            let mut new_idx = None;
            for (i, existing) in self.contacts.iter().enumerate() {
                let dist2 = (avg - existing.local_point_a).length_squared();
                if dist2 < min_dist {
                    min_dist = dist2;
                    new_idx = Some(i);
                }
            }

            new_slot = new_idx?;
        }

        self.contacts[new_slot] = contact;
        if new_slot == self.num_contacts as usize {
            self.num_contacts += 1;
        }
        Some(new_slot)
    }

    pub fn remove_contact(&mut self, index: usize) {
        let count = self.num_contacts as usize;
        if index >= count {
            return;
        }
        self.contacts.copy_within(index + 1..count, index);
        self.contacts[count - 1] = ContactPoint::default();
        self.num_contacts -= 1;
    }

    /// Recomputes world points and distances from the bodies' current transforms and drops
    /// points that separated or slid too far.
    pub fn refresh(&mut self, body_a: &Body, body_b: &Body) {
        for contact in self.contacts_mut() {
            contact.world_point_a = body_a.local_to_world(contact.local_point_a);
            contact.world_point_b = body_b.local_to_world(contact.local_point_b);
            contact.distance = (contact.world_point_a - contact.world_point_b).dot(contact.normal_world_on_b);
            contact.lifetime += 1;
        }

        let threshold_sq = self.breaking_threshold * self.breaking_threshold;
        let mut i = self.num_contacts as usize;
        while i > 0 {
            i -= 1;
            let contact = &self.contacts[i];
            if contact.distance > self.breaking_threshold {
                self.remove_contact(i);
                continue;
            }

            // tangential drift of B's point from A's point projected onto the contact plane
            let projected = contact.world_point_a - contact.normal_world_on_b * contact.distance;
            let drift: Vec3 = contact.world_point_b - projected;
            if drift.length_squared() > threshold_sq {
                self.remove_contact(i);
            }
        }
    }

    pub fn clear(&mut self) {
        self.contacts = [ContactPoint::default(); MAX_CONTACTS];
        self.num_contacts = 0;
    }
}
