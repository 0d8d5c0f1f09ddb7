/**
 * MILLWATCH KERNEL - Supervision atelier : parc CNC + contrôle qualité vision
 *
 * RÔLE :
 * Bibliothèque du kernel, utilisée par le binaire et par le devkit/tests.
 *
 * ARCHITECTURE :
 * controllers (protocoles) → manager (flotte + historique) → events (diffusion)
 * vision (pipeline d'inspection) → http (surface REST/WebSocket)
 */

pub mod config;
pub mod controllers;
pub mod error;
pub mod events;
pub mod health;
pub mod http;
pub mod manager;
pub mod models;
pub mod mqtt;
pub mod safety;
pub mod vision;
